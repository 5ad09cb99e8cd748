#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # PillTick 💊
//!
//! A companion console for BLE pill-reminder devices.
//!
//! The device is a small peripheral exposing the Nordic UART Service (NUS):
//! one characteristic accepts text lines, another notifies text lines back.
//! This crate turns that into a line-oriented session and builds a reminder
//! manager on top of it:
//!
//! - **Session controller**: one BLE session at a time, a linear state machine
//!   from device selection to a subscribed notify characteristic, with one
//!   write in flight and a single observable status
//! - **Reminder store**: reminders persisted locally as one JSON document
//! - **Dose scheduler**: the next instant each reminder fires and the soonest
//!   dose overall
//! - **Device sync**: pushes the reminder list and the host clock to the device
//!   as `CLEAR_REMINDERS`, `ADD_REMINDER ...` and `SYNC_TIME ...` lines
//! - **Console**: the log, reminder list and next-dose views behind the binary
//! - **Offline shell**: versioned caching for the console's web front end
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use pilltick::{
//!     BleChooser, DeviceSync, MemoryStore, NoopWakeLock, ReminderStore, SessionController,
//!     SessionParams,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let chooser = BleChooser::new(Duration::from_secs(5)).await?;
//!     let controller = SessionController::new(Arc::new(chooser), Arc::new(NoopWakeLock));
//!     let store = ReminderStore::new(MemoryStore::new());
//!
//!     controller.open_session(&SessionParams::default()).await?;
//!
//!     let sync = DeviceSync::new(&controller, &store);
//!     sync.sync_clock(&chrono::Utc::now()).await?;
//!     sync.push_reminders().await?;
//!
//!     controller.close_session().await;
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Bluetooth Low Energy transport and device selection
pub mod ble;
/// Offline caching for the web front end
pub mod cache;
/// Configuration file handling
pub mod config;
/// Console state and user actions
pub mod console;
/// Error types and handling
pub mod error;
/// Tracing subscriber setup
pub mod logging;
/// Line protocol spoken by the device
pub mod protocol;
/// Next-dose computation
pub mod schedule;
/// BLE session state machine
pub mod session;
/// Local reminder persistence
pub mod store;
/// Reminder and clock sync to the device
pub mod sync;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
mod testing;

// Re-export the main types for convenient usage
pub use ble::{BleChooser, BleDevice, DeviceChooser, GattDevice};
pub use cache::{CacheStorage, Fetcher, OfflineShell};
pub use config::ConsoleConfig;
pub use console::Console;
pub use error::{PillTickError, Result};
pub use schedule::{compute_next_dose, next_occurrence, NextDose};
pub use session::{NoopWakeLock, SessionController, SessionEvent, WakeLock};
pub use store::{FileStore, KeyValueStore, MemoryStore, ReminderStore};
pub use sync::DeviceSync;
pub use types::{
    DaysMask, DeviceInfo, DeviceRequest, Reminder, ReminderTime, Repeat, SessionParams,
    SessionState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// App version used when none is supplied; names the offline cache generation
pub const DEFAULT_APP_VERSION: &str = "Ver:0.2";

/// Nordic UART Service UUID
///
/// The pill-reminder firmware exposes its line channel through this service.
pub const NUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// NUS RX characteristic: lines written here are input to the device
pub const NUS_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// NUS TX characteristic: the device notifies its output lines here
pub const NUS_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e);
