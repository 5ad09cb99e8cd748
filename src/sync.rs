use chrono::{DateTime, TimeZone};
use tracing::{debug, info};

use crate::{
    error::Result,
    protocol::Command,
    session::SessionController,
    store::ReminderStore,
};

/// Mirrors the stored reminders and the host clock onto the device
///
/// Lines go out one at a time; each write completes before the next starts.
/// The device is not expected to acknowledge anything.
pub struct DeviceSync<'a> {
    controller: &'a SessionController,
    store: &'a ReminderStore,
}

impl<'a> DeviceSync<'a> {
    /// Sync through `controller` using the reminders in `store`
    #[must_use]
    pub const fn new(controller: &'a SessionController, store: &'a ReminderStore) -> Self {
        Self { controller, store }
    }

    /// Replace the device's reminder list with the stored one
    ///
    /// Sends `CLEAR_REMINDERS` followed by one `ADD_REMINDER` per reminder in
    /// store order. Returns how many reminders were sent.
    ///
    /// # Errors
    ///
    /// Returns the store error if the list cannot be read (nothing is sent),
    /// or the first [`SessionController::send_line`] failure; later lines
    /// are not attempted.
    pub async fn push_reminders(&self) -> Result<usize> {
        let reminders = self.store.load()?;

        self.send(&Command::ClearReminders).await?;
        for reminder in &reminders {
            self.send(&Command::add_reminder(reminder)).await?;
        }

        info!("Pushed {} reminder(s) to device", reminders.len());
        Ok(reminders.len())
    }

    /// Set the device clock to `now`, whole seconds since the Unix epoch
    ///
    /// # Errors
    ///
    /// Returns the [`SessionController::send_line`] failure.
    pub async fn sync_clock<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<()> {
        self.send(&Command::SyncTime(now.timestamp())).await?;
        info!("Device clock synced");
        Ok(())
    }

    async fn send(&self, command: &Command) -> Result<()> {
        debug!("Sync → {command}");
        self.controller.send_line(&command.to_string()).await
    }
}
