use chrono::{DateTime, TimeZone, Utc};
use std::{collections::VecDeque, fmt, sync::Arc};
use tracing::{debug, warn};

use crate::{
    config::ConsoleConfig,
    error::{PillTickError, Result},
    schedule::{compute_next_dose, format_countdown},
    session::{SessionController, SessionEvent},
    store::ReminderStore,
    sync::DeviceSync,
    types::{Reminder, ReminderTime, Repeat, SessionParams, SessionState},
};

/// Shown instead of the reminder list when it is empty
pub const EMPTY_HINT: &str = "No reminders yet. Add one to get started.";

const READY: &str = "Ready. Add reminders and/or connect.";
const MISSING_FIELDS: &str = "Please enter a name and time.";
const NO_DOSE_TEXT: &str = "No upcoming doses";
const NO_DOSE_COUNTDOWN: &str = "—";
const OUT_OF_REACH_HINT: &str = "ℹ️ Check that the device is powered on and in range.";

/// One line of the reminder list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderRow {
    /// Reminder id, for deletion
    pub id: String,
    /// `label — HH:MM`
    pub title: String,
    /// `Daily` or the active weekdays
    pub days: String,
}

impl From<&Reminder> for ReminderRow {
    fn from(reminder: &Reminder) -> Self {
        Self {
            id: reminder.id.clone(),
            title: format!("{} — {}", reminder.label, reminder.time),
            days: reminder.days_mask.to_string(),
        }
    }
}

/// The next-dose panel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextDoseView {
    /// `<label> at <date> HH:MM`, or "No upcoming doses"
    pub text: String,
    /// `HH:MM:SS`, `now`, or `—`
    pub countdown: String,
}

impl NextDoseView {
    fn nothing_due() -> Self {
        Self {
            text: NO_DOSE_TEXT.to_string(),
            countdown: NO_DOSE_COUNTDOWN.to_string(),
        }
    }
}

impl fmt::Display for NextDoseView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.text, self.countdown)
    }
}

/// Front end state: the log, the reminder views and the user actions
///
/// Every failure ends up as a log line; no action returns an error.
pub struct Console {
    controller: Arc<SessionController>,
    store: ReminderStore,
    params: SessionParams,
    sync_clock_on_connect: bool,
    log: VecDeque<String>,
    capacity: usize,
    unseen: usize,
}

impl Console {
    /// Create a console over an idle controller
    pub fn new(controller: Arc<SessionController>, store: ReminderStore, config: &ConsoleConfig) -> Self {
        let mut console = Self {
            controller,
            store,
            params: config.session_params(),
            sync_clock_on_connect: config.sync_clock_on_connect,
            log: VecDeque::new(),
            capacity: config.log_capacity.max(1),
            unseen: 0,
        };
        console.log(READY);
        console
    }

    /// Status line text
    #[must_use]
    pub fn status(&self) -> SessionState {
        self.controller.state()
    }

    /// The session controller this console drives
    #[must_use]
    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    /// Scroll-back, oldest first
    pub fn log_lines(&self) -> impl Iterator<Item = &str> {
        self.log.iter().map(String::as_str)
    }

    /// Lines appended since the previous call
    pub fn take_unseen(&mut self) -> Vec<String> {
        let start = self.log.len() - self.unseen;
        self.unseen = 0;
        self.log.iter().skip(start).cloned().collect()
    }

    fn log(&mut self, line: impl Into<String>) {
        if self.log.len() == self.capacity {
            self.log.pop_front();
        }
        self.log.push_back(line.into());
        self.unseen = (self.unseen + 1).min(self.log.len());
    }

    fn warn(&mut self, error: &PillTickError) {
        self.log(format!("⚠️ {error}"));
    }

    /// Open a session, then sync the device clock if configured
    ///
    /// A controller left in the error state by an earlier attempt is reset
    /// first.
    pub async fn connect(&mut self) -> bool {
        if self.controller.state() == SessionState::Error {
            self.controller.reset().await;
        }

        match self.controller.open_session(&self.params).await {
            Ok(info) => {
                debug!("Console connected to {}", info.name);
                self.log("✔ Connected.");
            }
            Err(e) => {
                self.warn(&e);
                if e.is_connection_error() {
                    self.log(OUT_OF_REACH_HINT);
                }
                return false;
            }
        }

        if self.sync_clock_on_connect {
            let synced = DeviceSync::new(&self.controller, &self.store)
                .sync_clock(&Utc::now())
                .await;
            if let Err(e) = synced {
                self.warn(&e);
            }
        }
        true
    }

    /// Close the session; the disconnect itself is logged from the event stream
    pub async fn disconnect(&mut self) {
        self.controller.close_session().await;
    }

    /// Send a line typed by the user; empty input is ignored
    pub async fn send_manual(&mut self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        match self.controller.send_line(text).await {
            Ok(()) => {
                self.log(format!("You → {text}"));
                true
            }
            Err(e) => {
                self.log(format!("⚠️ send error: {e}"));
                false
            }
        }
    }

    /// Push the stored reminders to the device
    pub async fn push_reminders(&mut self) -> bool {
        let pushed = DeviceSync::new(&self.controller, &self.store)
            .push_reminders()
            .await;
        match pushed {
            Ok(_) => {
                self.log("✔ Reminders synced.");
                true
            }
            Err(e) => {
                self.warn(&e);
                false
            }
        }
    }

    /// Validate the add form and store a new reminder
    pub fn add_reminder(&mut self, label: &str, time: &str, repeat: &Repeat) -> Option<Reminder> {
        if label.trim().is_empty() || time.trim().is_empty() {
            self.log(format!("⚠️ {MISSING_FIELDS}"));
            return None;
        }

        let added = time
            .trim()
            .parse::<ReminderTime>()
            .and_then(|time| self.store.add(label, time, repeat.days_mask()));
        match added {
            Ok(reminder) => Some(reminder),
            Err(e) => {
                self.report_store_error(&e);
                None
            }
        }
    }

    /// Delete a reminder by id
    pub fn delete_reminder(&mut self, id: &str) -> bool {
        match self.store.delete(id) {
            Ok(found) => found,
            Err(e) => {
                self.report_store_error(&e);
                false
            }
        }
    }

    fn report_store_error(&mut self, error: &PillTickError) {
        if error.is_storage_error() {
            warn!("Reminder storage degraded: {error}");
        }
        self.warn(error);
    }

    fn reminders(&mut self) -> Vec<Reminder> {
        match self.store.load() {
            Ok(reminders) => reminders,
            Err(e) => {
                self.report_store_error(&e);
                Vec::new()
            }
        }
    }

    /// Reminder list sorted by time of day; empty means show [`EMPTY_HINT`]
    pub fn reminder_rows(&mut self) -> Vec<ReminderRow> {
        let mut reminders = self.reminders();
        reminders.sort_by_key(|r| r.time);
        reminders.iter().map(ReminderRow::from).collect()
    }

    /// Next-dose panel as of `now`
    pub fn next_dose<Tz>(&mut self, now: &DateTime<Tz>) -> NextDoseView
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let reminders = self.reminders();
        let Some(next) = compute_next_dose(&reminders, now) else {
            return NextDoseView::nothing_due();
        };

        NextDoseView {
            text: format!(
                "{} at {}",
                next.reminder.label,
                next.when.format("%a %b %d %Y %H:%M")
            ),
            countdown: format_countdown(&next.when, now),
        }
    }

    /// Fold one controller event into the log
    pub fn handle_session_event(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::LineReceived(line) => self.log(format!("Device → {line}")),
            SessionEvent::Disconnected => self.log("ℹ️ Device disconnected."),
            SessionEvent::StateChanged(state) => debug!("Status: {state}"),
        }
    }

    /// Store backing this console
    #[must_use]
    pub const fn store(&self) -> &ReminderStore {
        &self.store
    }
}

/// Parse `Sun,Mon,...` style day lists for the custom repeat option
///
/// # Errors
///
/// Returns [`PillTickError::InvalidReminder`] for an unknown day name or an
/// empty list.
pub fn parse_repeat(days: &str) -> Result<Repeat> {
    if days.eq_ignore_ascii_case("daily") {
        return Ok(Repeat::Daily);
    }

    let days = days
        .split(',')
        .map(str::trim)
        .filter(|day| !day.is_empty())
        .map(|day| {
            day.parse::<chrono::Weekday>()
                .map_err(|_| PillTickError::InvalidReminder(format!("unknown day {day:?}")))
        })
        .collect::<Result<Vec<_>>>()?;

    if days.is_empty() {
        return Err(PillTickError::InvalidReminder(
            "pick at least one day".to_string(),
        ));
    }
    Ok(Repeat::Custom(days))
}
