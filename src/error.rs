use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while talking to a pill-reminder device or managing reminders
#[derive(Error, Debug)]
pub enum PillTickError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter is available on this host
    #[error("Bluetooth is not available on this system")]
    BluetoothUnavailable,

    /// The device chooser was dismissed without a selection
    #[error("No device selected")]
    UserCancelled,

    /// Opening the transport to the selected device failed
    #[error("Failed to connect to device: {0}")]
    DeviceUnreachable(String),

    /// The peripheral does not expose the expected service
    #[error("Service {0} not found on device")]
    ServiceNotFound(Uuid),

    /// The service does not expose one of the expected characteristics
    #[error("Characteristic {0} not found on device")]
    CharacteristicNotFound(Uuid),

    /// Enabling notifications on the notify characteristic failed
    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    /// An operation that needs a live session was invoked without one
    #[error("Not connected")]
    NotConnected,

    /// The peripheral rejected a write
    #[error("Write rejected: {0}")]
    WriteRejected(String),

    /// A session is already being opened or is open
    #[error("Session busy: {state}")]
    SessionBusy {
        /// Current state description
        state: String,
    },

    /// The session was closed while an operation was in flight
    #[error("Device disconnected")]
    Disconnected,

    /// Invalid parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Encoded line does not fit in one write
    #[error("Line too long: {len} bytes, maximum is {max}")]
    LineTooLong {
        /// Encoded length including the terminator
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Reminder failed validation at the store boundary
    #[error("Invalid reminder: {0}")]
    InvalidReminder(String),

    /// Local persistence is blocked or failing
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Network unreachable and nothing cached for the request
    #[error("Offline and no cached copy of {url}")]
    Offline {
        /// Requested URL
        url: String,
    },

    /// A network fetch failed
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// Configuration could not be loaded or saved
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pilltick operations
pub type Result<T> = std::result::Result<T, PillTickError>;

impl PillTickError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::BluetoothUnavailable
                | Self::DeviceUnreachable(_)
                | Self::NotConnected
                | Self::Disconnected
        )
    }

    /// Check if this error leaves the session controller in the error state
    ///
    /// These are the `open_session` failures; the controller must be reset
    /// (or closed) before another session can be opened.
    #[must_use]
    pub const fn requires_reset(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::BluetoothUnavailable
                | Self::UserCancelled
                | Self::DeviceUnreachable(_)
                | Self::ServiceNotFound(_)
                | Self::CharacteristicNotFound(_)
                | Self::SubscriptionFailed(_)
        )
    }

    /// Check if this error comes from local persistence
    #[must_use]
    pub const fn is_storage_error(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}
