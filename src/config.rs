use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{PillTickError, Result},
    protocol::MAX_ATTRIBUTE_LEN,
    store::FileStore,
    types::SessionParams,
    NUS_RX_CHAR_UUID, NUS_SERVICE_UUID, NUS_TX_CHAR_UUID,
};

/// Console settings, stored as JSON
///
/// Every field has a default, so a partial (or missing) file is fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Serial service
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    /// Write characteristic (device input)
    #[serde(default = "default_rx_char_uuid")]
    pub rx_char_uuid: Uuid,
    /// Notify characteristic (device output)
    #[serde(default = "default_tx_char_uuid")]
    pub tx_char_uuid: Uuid,
    /// Only offer devices whose advertised name starts with this
    #[serde(default)]
    pub name_prefix: Option<String>,
    /// Scan duration before the chooser offers devices
    #[serde(default = "default_scan_window_ms")]
    pub scan_window_ms: u64,
    /// Encoded size limit of one outbound line, terminator included
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Send `SYNC_TIME` right after connecting
    #[serde(default = "default_true")]
    pub sync_clock_on_connect: bool,
    /// Reminder storage; `None` means the per-user data directory
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    /// Log filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String, // "trace", "debug", "info", "warn", "error"
    /// Console scroll-back, in lines
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    /// Offline shell version; names the cache generation
    #[serde(default = "default_app_version")]
    pub app_version: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            rx_char_uuid: default_rx_char_uuid(),
            tx_char_uuid: default_tx_char_uuid(),
            name_prefix: None,
            scan_window_ms: default_scan_window_ms(),
            max_line_bytes: default_max_line_bytes(),
            sync_clock_on_connect: default_true(),
            storage_dir: None,
            log_level: default_log_level(),
            log_capacity: default_log_capacity(),
            app_version: default_app_version(),
        }
    }
}

const fn default_service_uuid() -> Uuid {
    NUS_SERVICE_UUID
}
const fn default_rx_char_uuid() -> Uuid {
    NUS_RX_CHAR_UUID
}
const fn default_tx_char_uuid() -> Uuid {
    NUS_TX_CHAR_UUID
}
const fn default_scan_window_ms() -> u64 {
    5000
}
const fn default_max_line_bytes() -> usize {
    MAX_ATTRIBUTE_LEN
}
const fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
const fn default_log_capacity() -> usize {
    200
}
fn default_app_version() -> String {
    crate::DEFAULT_APP_VERSION.to_string()
}

impl ConsoleConfig {
    /// `<config dir>/pilltick/config.json` for the current user
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pilltick").join("config.json"))
    }

    /// Read settings from `path`; a missing file yields the defaults
    ///
    /// # Errors
    ///
    /// Returns [`PillTickError::Config`] if the file exists but cannot be read
    /// or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(PillTickError::Config(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };

        serde_json::from_str(&contents)
            .map_err(|e| PillTickError::Config(format!("{}: {e}", path.display())))
    }

    /// Write settings to `path` as pretty JSON, creating parent directories
    ///
    /// # Errors
    ///
    /// Returns [`PillTickError::Config`] on serialization failure or
    /// [`PillTickError::Io`] if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PillTickError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        Ok(())
    }

    /// Session parameters for the configured service
    #[must_use]
    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            service: self.service_uuid,
            rx_char: self.rx_char_uuid,
            tx_char: self.tx_char_uuid,
            name_prefix: self.name_prefix.clone(),
        }
    }

    /// How long the chooser scans before offering devices
    #[must_use]
    pub const fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    /// Directory of the reminder store
    ///
    /// # Errors
    ///
    /// Returns [`PillTickError::Config`] if no directory is configured and the
    /// platform has no per-user data directory.
    pub fn storage_dir(&self) -> Result<PathBuf> {
        self.storage_dir
            .clone()
            .or_else(FileStore::default_dir)
            .ok_or_else(|| PillTickError::Config("Could not determine data directory".to_string()))
    }
}
