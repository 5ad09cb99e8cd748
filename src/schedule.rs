use chrono::{DateTime, Datelike, Days, TimeZone};

use crate::types::Reminder;

/// Calendar days scanned before giving up on a reminder
pub const SCAN_DAYS: u64 = 8;

/// The soonest upcoming dose across a reminder list
#[derive(Debug, Clone)]
pub struct NextDose<'a, Tz: TimeZone> {
    /// When the dose is due
    pub when: DateTime<Tz>,
    /// Reminder that owns it
    pub reminder: &'a Reminder,
}

/// Next instant strictly after `now` at which `reminder` fires
///
/// Candidates are the reminder's wall-clock time on `now`'s day and the
/// following days, in `now`'s time zone, at zero seconds. A candidate equal to
/// `now` is skipped. Days where the time does not exist (a DST gap) are
/// skipped; an ambiguous time resolves to the earlier instant. Returns `None`
/// if nothing matches within [`SCAN_DAYS`].
pub fn next_occurrence<Tz: TimeZone>(
    reminder: &Reminder,
    now: &DateTime<Tz>,
) -> Option<DateTime<Tz>> {
    let today = now.date_naive();
    let hour = u32::from(reminder.time.hour());
    let minute = u32::from(reminder.time.minute());

    (0..SCAN_DAYS).find_map(|offset| {
        let day = today.checked_add_days(Days::new(offset))?;
        if !reminder.days_mask.contains(day.weekday()) {
            return None;
        }
        let local = day.and_hms_opt(hour, minute, 0)?;
        let candidate = now.timezone().from_local_datetime(&local).earliest()?;
        (candidate > *now).then_some(candidate)
    })
}

/// Soonest [`next_occurrence`] over all reminders
///
/// On a tie the reminder that comes first in `reminders` wins.
pub fn compute_next_dose<'a, Tz: TimeZone>(
    reminders: &'a [Reminder],
    now: &DateTime<Tz>,
) -> Option<NextDose<'a, Tz>> {
    let mut best: Option<NextDose<'a, Tz>> = None;

    for reminder in reminders {
        let Some(when) = next_occurrence(reminder, now) else {
            continue;
        };
        let sooner = match &best {
            Some(current) => when < current.when,
            None => true,
        };
        if sooner {
            best = Some(NextDose { when, reminder });
        }
    }

    best
}

/// Remaining time as `HH:MM:SS`, or `now` once due
///
/// Hours are not wrapped, so a dose six days out reads `144:00:00`.
pub fn format_countdown<Tz: TimeZone>(when: &DateTime<Tz>, now: &DateTime<Tz>) -> String {
    let millis = when.timestamp_millis() - now.timestamp_millis();
    if millis <= 0 {
        return "now".to_string();
    }

    let seconds = millis / 1000;
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60
    )
}
