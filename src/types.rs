use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::{
    error::{PillTickError, Result},
    NUS_RX_CHAR_UUID, NUS_SERVICE_UUID, NUS_TX_CHAR_UUID,
};

/// Session controller state
///
/// The machine is strictly linear: `Idle → Requesting → Connecting →
/// DiscoveringService → DiscoveringCharacteristics → Subscribing → Connected →
/// Disconnecting → Idle`, with `Error` reachable from any non-idle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    /// No session; a new one may be opened
    #[default]
    Idle,
    /// Waiting for the device chooser
    Requesting,
    /// Opening the transport
    Connecting,
    /// Resolving the serial service
    DiscoveringService,
    /// Resolving the write and notify characteristics
    DiscoveringCharacteristics,
    /// Enabling notifications
    Subscribing,
    /// Session open, lines may be sent
    Connected,
    /// Explicit teardown in progress
    Disconnecting,
    /// Opening failed; reset required
    Error,
}

impl SessionState {
    /// Whether a new session may be opened from this state
    #[must_use]
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Whether the session is between selection and `Connected`
    #[must_use]
    pub const fn is_opening(self) -> bool {
        matches!(
            self,
            Self::Requesting
                | Self::Connecting
                | Self::DiscoveringService
                | Self::DiscoveringCharacteristics
                | Self::Subscribing
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "disconnected"),
            Self::Requesting => write!(f, "requesting device..."),
            Self::Connecting => write!(f, "connecting..."),
            Self::DiscoveringService => write!(f, "getting service..."),
            Self::DiscoveringCharacteristics => write!(f, "getting characteristics..."),
            Self::Subscribing => write!(f, "subscribing..."),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting..."),
            Self::Error => write!(f, "error / idle"),
        }
    }
}

/// Device information reported by the chooser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Advertised device name
    pub name: String,
    /// Device address (MAC on Linux/Windows, platform id on macOS)
    pub address: String,
    /// Signal strength (RSSI)
    pub rssi: Option<i16>,
}

impl DeviceInfo {
    /// Create new device info
    #[must_use]
    pub const fn new(name: String, address: String, rssi: Option<i16>) -> Self {
        Self {
            name,
            address,
            rssi,
        }
    }
}

/// What the device chooser should offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    /// Service the session will use; devices advertising it are offered first
    pub service: Uuid,
    /// Only offer devices whose name starts with this prefix
    pub name_prefix: Option<String>,
}

impl DeviceRequest {
    /// Whether a device with the given advertised name passes the filter
    #[must_use]
    pub fn accepts(&self, name: Option<&str>) -> bool {
        match (&self.name_prefix, name) {
            (None, _) => true,
            (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
            (Some(_), None) => false,
        }
    }
}

/// Session parameters
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Serial service UUID
    pub service: Uuid,
    /// Write characteristic (device input)
    pub rx_char: Uuid,
    /// Notify characteristic (device output)
    pub tx_char: Uuid,
    /// Optional chooser name filter
    pub name_prefix: Option<String>,
}

impl SessionParams {
    /// Chooser request derived from these parameters
    #[must_use]
    pub fn device_request(&self) -> DeviceRequest {
        DeviceRequest {
            service: self.service,
            name_prefix: self.name_prefix.clone(),
        }
    }
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            service: NUS_SERVICE_UUID,
            rx_char: NUS_RX_CHAR_UUID,
            tx_char: NUS_TX_CHAR_UUID,
            name_prefix: None,
        }
    }
}

/// Time of day of a reminder, minute precision, 24h clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReminderTime {
    hour: u8,
    minute: u8,
}

impl ReminderTime {
    /// Create a time of day
    ///
    /// # Errors
    ///
    /// Returns [`PillTickError::InvalidReminder`] if the hour or minute is out of range.
    pub fn new(hour: u8, minute: u8) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(PillTickError::InvalidReminder(format!(
                "time out of range: {hour}:{minute}"
            )));
        }
        Ok(Self { hour, minute })
    }

    /// Hour, 0-23
    #[must_use]
    pub const fn hour(self) -> u8 {
        self.hour
    }

    /// Minute, 0-59
    #[must_use]
    pub const fn minute(self) -> u8 {
        self.minute
    }
}

impl FromStr for ReminderTime {
    type Err = PillTickError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PillTickError::InvalidReminder(format!("time must be HH:MM, got {s:?}"));

        let (h, m) = s.split_once(':').ok_or_else(invalid)?;
        if h.len() != 2 || m.len() != 2 {
            return Err(invalid());
        }
        let hour = h.parse::<u8>().map_err(|_| invalid())?;
        let minute = m.parse::<u8>().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for ReminderTime {
    type Error = PillTickError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ReminderTime> for String {
    fn from(value: ReminderTime) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ReminderTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Weekday bit set; bit 0 is Sunday, bit 6 Saturday, and 0 means every day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct DaysMask(u8);

impl DaysMask {
    /// Every day of the week
    pub const DAILY: Self = Self(0);

    const ALL_BITS: u8 = 0x7F;
    const SHORT_NAMES: [&'static str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

    /// Create a mask from raw bits
    ///
    /// # Errors
    ///
    /// Returns [`PillTickError::InvalidReminder`] if bits above Saturday are set.
    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits & !Self::ALL_BITS != 0 {
            return Err(PillTickError::InvalidReminder(format!(
                "days mask {bits:#04x} has bits outside Sun..Sat"
            )));
        }
        Ok(Self(bits))
    }

    /// Create a mask from a set of weekdays
    pub fn from_days(days: impl IntoIterator<Item = Weekday>) -> Self {
        Self(
            days.into_iter()
                .fold(0, |mask, day| mask | (1 << day.num_days_from_sunday())),
        )
    }

    /// Raw bits
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether the mask means "every day"
    #[must_use]
    pub const fn is_daily(self) -> bool {
        self.0 == 0
    }

    /// Whether the reminder is active on the given weekday
    #[must_use]
    pub fn contains(self, day: Weekday) -> bool {
        self.0 == 0 || self.0 & (1 << day.num_days_from_sunday()) != 0
    }
}

impl TryFrom<u8> for DaysMask {
    type Error = PillTickError;

    fn try_from(value: u8) -> Result<Self> {
        Self::from_bits(value)
    }
}

impl From<DaysMask> for u8 {
    fn from(value: DaysMask) -> Self {
        value.0
    }
}

impl fmt::Display for DaysMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_daily() {
            return write!(f, "Daily");
        }
        let names: Vec<&str> = Self::SHORT_NAMES
            .iter()
            .enumerate()
            .filter(|(i, _)| self.0 & (1 << i) != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join(", "))
    }
}

/// Repeat choice on the add-reminder form
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repeat {
    /// Every day
    Daily,
    /// Only the listed weekdays
    Custom(Vec<Weekday>),
}

impl Repeat {
    /// Mask encoding of this choice
    #[must_use]
    pub fn days_mask(&self) -> DaysMask {
        match self {
            Self::Daily => DaysMask::DAILY,
            Self::Custom(days) => DaysMask::from_days(days.iter().copied()),
        }
    }
}

/// A stored pill reminder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    /// Client-generated identifier, unique within the store
    pub id: String,
    /// Display name of the pill
    pub label: String,
    /// Time of day
    pub time: ReminderTime,
    /// Active weekdays
    pub days_mask: DaysMask,
}

impl Reminder {
    /// Create a reminder with the given id
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        time: ReminderTime,
        days_mask: DaysMask,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            time,
            days_mask,
        }
    }

    /// Check the invariants the wire protocol and the store rely on
    ///
    /// # Errors
    ///
    /// Returns [`PillTickError::InvalidReminder`] if the id is empty or contains
    /// whitespace, or the label is blank.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() || self.id.chars().any(char::is_whitespace) {
            return Err(PillTickError::InvalidReminder(format!(
                "id must be a non-empty token, got {:?}",
                self.id
            )));
        }
        if self.label.trim().is_empty() {
            return Err(PillTickError::InvalidReminder(
                "label must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
