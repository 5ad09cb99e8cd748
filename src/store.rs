use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::{PillTickError, Result},
    types::{DaysMask, Reminder, ReminderTime},
};

/// Storage key of the reminder list; a schema change needs a new key
pub const STORE_KEY: &str = "PILL_REMINDERS_V1";

const ID_LEN: usize = 7;

/// Minimal local key-value persistence
pub trait KeyValueStore: Send + Sync {
    /// Read a value; `Ok(None)` if the key was never written
    ///
    /// # Errors
    ///
    /// Returns [`PillTickError::StorageUnavailable`] if the store cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one
    ///
    /// # Errors
    ///
    /// Returns [`PillTickError::StorageUnavailable`] if the store cannot be written.
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// One JSON file per key inside a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Store files under `dir`, created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data dir>/pilltick` for the current user
    #[must_use]
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("pilltick"))
    }

    /// Directory holding the files
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

fn unavailable(context: &str, e: &io::Error) -> PillTickError {
    PillTickError::StorageUnavailable(format!("{context}: {e}"))
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable("read failed", &e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| unavailable("cannot create store", &e))?;

        let path = self.path(key);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, value).map_err(|e| unavailable("write failed", &e))?;
        fs::rename(&staging, &path).map_err(|e| unavailable("write failed", &e))?;

        debug!("Stored {} bytes under {key}", value.len());
        Ok(())
    }
}

/// Process-local store; a blocked instance refuses every call
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    blocked: bool,
}

impl MemoryStore {
    /// Empty, working store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that behaves like persistence disabled by the host
    #[must_use]
    pub fn blocked() -> Self {
        Self {
            entries: Mutex::default(),
            blocked: true,
        }
    }

    fn check(&self) -> Result<()> {
        if self.blocked {
            return Err(PillTickError::StorageUnavailable(
                "local storage is disabled".to_string(),
            ));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Sole owner of the persisted reminder list
///
/// Every mutation is a read-modify-write of the whole list under
/// [`STORE_KEY`]. Records are validated on the way in; the list keeps
/// insertion order.
pub struct ReminderStore {
    backend: Box<dyn KeyValueStore>,
}

impl ReminderStore {
    /// Wrap a key-value backend
    pub fn new(backend: impl KeyValueStore + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    /// All reminders in insertion order
    ///
    /// A missing key reads as an empty list. Unparseable data is logged and
    /// also treated as empty, as are individual records that fail validation.
    ///
    /// # Errors
    ///
    /// Returns [`PillTickError::StorageUnavailable`] if the backend cannot be read.
    pub fn load(&self) -> Result<Vec<Reminder>> {
        let Some(raw) = self.backend.get(STORE_KEY)? else {
            return Ok(Vec::new());
        };

        let reminders: Vec<Reminder> = match serde_json::from_str(&raw) {
            Ok(list) => list,
            Err(e) => {
                warn!("Ignoring unreadable reminder list: {e}");
                return Ok(Vec::new());
            }
        };

        Ok(reminders
            .into_iter()
            .filter(|r| match r.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!("Skipping stored reminder {:?}: {e}", r.id);
                    false
                }
            })
            .collect())
    }

    fn save(&self, reminders: &[Reminder]) -> Result<()> {
        let json = serde_json::to_string(reminders)
            .map_err(|e| PillTickError::StorageUnavailable(format!("encode failed: {e}")))?;
        self.backend.set(STORE_KEY, &json)
    }

    /// Look up one reminder
    ///
    /// # Errors
    ///
    /// Returns [`PillTickError::StorageUnavailable`] if the backend cannot be read.
    pub fn get(&self, id: &str) -> Result<Option<Reminder>> {
        Ok(self.load()?.into_iter().find(|r| r.id == id))
    }

    /// Insert a reminder, or replace the one with the same id in place
    ///
    /// # Errors
    ///
    /// Returns [`PillTickError::InvalidReminder`] if the record fails validation,
    /// or [`PillTickError::StorageUnavailable`] if persistence fails.
    pub fn upsert(&self, reminder: Reminder) -> Result<()> {
        reminder.validate()?;

        let mut reminders = self.load()?;
        match reminders.iter_mut().find(|r| r.id == reminder.id) {
            Some(existing) => *existing = reminder,
            None => reminders.push(reminder),
        }
        self.save(&reminders)
    }

    /// Create and store a reminder with a fresh id
    ///
    /// # Errors
    ///
    /// Returns [`PillTickError::InvalidReminder`] for a blank label, or
    /// [`PillTickError::StorageUnavailable`] if persistence fails.
    pub fn add(&self, label: &str, time: ReminderTime, days_mask: DaysMask) -> Result<Reminder> {
        let existing = self.load()?;
        let reminder = Reminder::new(fresh_id(&existing), label.trim(), time, days_mask);
        self.upsert(reminder.clone())?;
        Ok(reminder)
    }

    /// Remove a reminder; returns whether it existed
    ///
    /// # Errors
    ///
    /// Returns [`PillTickError::StorageUnavailable`] if persistence fails.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut reminders = self.load()?;
        let before = reminders.len();
        reminders.retain(|r| r.id != id);
        if reminders.len() == before {
            return Ok(false);
        }
        self.save(&reminders)?;
        Ok(true)
    }
}

fn fresh_id(existing: &[Reminder]) -> String {
    loop {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(ID_LEN);
        if !existing.iter().any(|r| r.id == id) {
            return id;
        }
    }
}
