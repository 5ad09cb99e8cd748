//! Interactive console for a BLE pill-reminder device
//!
//! Reads commands from stdin; type `help` for the list.

use async_trait::async_trait;
use chrono::Local;
use clap::Parser;
use pilltick::{
    console::{parse_repeat, EMPTY_HINT},
    logging, BleChooser, Console, ConsoleConfig, DeviceChooser, DeviceRequest, FileStore,
    GattDevice, NoopWakeLock, PillTickError, ReminderStore, SessionController, SessionEvent,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pilltick", version)]
#[command(about = "Companion console for BLE pill-reminder devices")]
struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Log filter, e.g. "debug" or "pilltick=trace"
    #[arg(long)]
    log_level: Option<String>,
    /// Only offer devices whose name starts with this prefix
    #[arg(long)]
    name_prefix: Option<String>,
}

const HELP: &str = "\
Commands:
  connect                         pick a device and connect
  disconnect                      close the session
  send <text>                     send one line to the device
  sync                            push all reminders to the device
  add <HH:MM> <daily|Mon,Wed,..> <label>
                                  add a reminder
  rm <id>                         delete a reminder
  list                            show reminders
  next                            show the next dose
  status                          show the session status
  help                            show this text
  quit                            exit";

/// Chooser used when the host has no Bluetooth adapter
struct NoBluetooth;

#[async_trait]
impl DeviceChooser for NoBluetooth {
    async fn request_device(
        &self,
        _request: &DeviceRequest,
    ) -> pilltick::Result<Option<Arc<dyn GattDevice>>> {
        Err(PillTickError::BluetoothUnavailable)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config_path = cli.config.or_else(ConsoleConfig::default_path);
    let mut config = match &config_path {
        Some(path) => ConsoleConfig::load(path)?,
        None => ConsoleConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(prefix) = cli.name_prefix {
        config.name_prefix = Some(prefix);
    }
    logging::init(&config.log_level);
    info!("PillTick {} starting", pilltick::VERSION);

    let store = ReminderStore::new(FileStore::new(config.storage_dir()?));

    let chooser: Arc<dyn DeviceChooser> = match BleChooser::new(config.scan_window()).await {
        Ok(chooser) => Arc::new(chooser),
        Err(e) => {
            warn!("Bluetooth unavailable: {e}");
            println!("❌ Bluetooth is not available on this system; reminders still work.");
            Arc::new(NoBluetooth)
        }
    };

    let controller = Arc::new(
        SessionController::new(chooser, Arc::new(NoopWakeLock))
            .with_max_line_bytes(config.max_line_bytes),
    );
    let mut events = controller.subscribe();
    let mut console = Console::new(Arc::clone(&controller), store, &config);

    flush(&mut console);
    print_next_dose(&mut console);

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut minute = tokio::time::interval(Duration::from_secs(60));
    minute.tick().await;

    loop {
        tokio::select! {
            line = input.next_line() => {
                let Some(line) = line? else { break };
                if !run_command(&mut console, line.trim()).await {
                    break;
                }
            }
            Some(event) = events.recv() => {
                console.handle_session_event(&event);
                if let SessionEvent::StateChanged(state) = event {
                    println!("[{state}]");
                }
            }
            _ = minute.tick() => print_next_dose(&mut console),
        }
        flush(&mut console);
    }

    console.disconnect().await;
    while let Ok(event) = events.try_recv() {
        console.handle_session_event(&event);
    }
    flush(&mut console);
    Ok(())
}

/// Run one command line; returns `false` to exit
async fn run_command(console: &mut Console, line: &str) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match command {
        "" => {}
        "connect" => {
            console.connect().await;
        }
        "disconnect" => console.disconnect().await,
        "send" => {
            console.send_manual(rest).await;
        }
        "sync" => {
            console.push_reminders().await;
        }
        "add" => add_reminder(console, rest),
        "rm" => {
            if !console.delete_reminder(rest) {
                println!("No reminder with id {rest:?}");
            }
            print_next_dose(console);
        }
        "list" => print_reminders(console),
        "next" => print_next_dose(console),
        "status" => {
            let status = console.status();
            match console.controller().device_info().await {
                Some(device) => println!("Status: {status} ({})", device.name),
                None => println!("Status: {status}"),
            }
        }
        "help" | "?" => println!("{HELP}"),
        "quit" | "exit" => return false,
        other => println!("Unknown command {other:?}; type `help`"),
    }
    true
}

fn add_reminder(console: &mut Console, args: &str) {
    let mut parts = args.splitn(3, char::is_whitespace);
    let time = parts.next().unwrap_or_default();
    let repeat = parts.next().unwrap_or("daily");
    let label = parts.next().unwrap_or_default();

    let repeat = match parse_repeat(repeat) {
        Ok(repeat) => repeat,
        Err(e) => {
            println!("⚠️ {e}");
            return;
        }
    };
    if let Some(reminder) = console.add_reminder(label, time, &repeat) {
        println!("Added {} ({})", reminder.label, reminder.id);
        print_next_dose(console);
    }
}

fn print_reminders(console: &mut Console) {
    let rows = console.reminder_rows();
    if rows.is_empty() {
        println!("{EMPTY_HINT}");
        return;
    }
    for row in rows {
        println!("  {:<8} {}  [{}]", row.id, row.title, row.days);
    }
}

fn print_next_dose(console: &mut Console) {
    println!("Next dose: {}", console.next_dose(&Local::now()));
}

fn flush(console: &mut Console) {
    for line in console.take_unseen() {
        println!("{line}");
    }
}
