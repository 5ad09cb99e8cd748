use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::{
    error::{PillTickError, Result},
    types::Reminder,
};

/// Line terminator appended to every outbound line
pub const LINE_TERMINATOR: u8 = b'\n';

/// Largest attribute value a GATT write may carry
pub const MAX_ATTRIBUTE_LEN: usize = 512;

/// Character substituted for whitespace runs in labels
pub const LABEL_JOIN: char = '_';

/// Commands understood by the pill-reminder firmware
///
/// Every command is one whitespace-delimited text line. Free text typed by
/// the user bypasses this type and goes to the session as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Set the device clock, seconds since the Unix epoch
    SyncTime(i64),
    /// Drop every reminder held by the device
    ClearReminders,
    /// Add one reminder
    AddReminder {
        /// Reminder id
        id: String,
        /// `HH:MM`
        time: String,
        /// Weekday bit set
        days_mask: u8,
        /// Label with whitespace already collapsed
        label: String,
    },
}

impl Command {
    /// Build an `ADD_REMINDER` command from a stored reminder
    #[must_use]
    pub fn add_reminder(reminder: &Reminder) -> Self {
        Self::AddReminder {
            id: reminder.id.clone(),
            time: reminder.time.to_string(),
            days_mask: reminder.days_mask.bits(),
            label: wire_label(&reminder.label),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SyncTime(epoch) => write!(f, "SYNC_TIME {epoch}"),
            Self::ClearReminders => write!(f, "CLEAR_REMINDERS"),
            Self::AddReminder {
                id,
                time,
                days_mask,
                label,
            } => write!(f, "ADD_REMINDER {id} {time} {days_mask} {label}"),
        }
    }
}

/// Collapse every whitespace run in a label into a single [`LABEL_JOIN`]
///
/// Leading and trailing whitespace become a join character too, so the
/// result never contains the protocol's delimiter.
#[must_use]
pub fn wire_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut in_space = false;
    for c in label.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(LABEL_JOIN);
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// Encode one outbound line: UTF-8 text plus a single terminator
///
/// # Errors
///
/// Returns [`PillTickError::InvalidParameters`] for empty text or text that
/// already contains a line break, and [`PillTickError::LineTooLong`] if the
/// encoded line exceeds `max_len` bytes.
pub fn encode_line(text: &str, max_len: usize) -> Result<Bytes> {
    if text.is_empty() {
        return Err(PillTickError::InvalidParameters(
            "line must not be empty".to_string(),
        ));
    }
    if text.contains(['\n', '\r']) {
        return Err(PillTickError::InvalidParameters(
            "line must not contain line breaks".to_string(),
        ));
    }

    let len = text.len() + 1;
    if len > max_len {
        return Err(PillTickError::LineTooLong { len, max: max_len });
    }

    let mut buf = BytesMut::with_capacity(len);
    buf.put_slice(text.as_bytes());
    buf.put_u8(LINE_TERMINATOR);
    Ok(buf.freeze())
}

/// Decode one notification payload into a display line
///
/// Invalid UTF-8 sequences are replaced rather than rejected; trailing
/// whitespace (including the firmware's terminator) is trimmed, leading
/// whitespace is kept.
#[must_use]
pub fn decode_line(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).trim_end().to_string()
}
