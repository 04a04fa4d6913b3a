//! Cadence checks for the scheduling loop.
//!
//! Elapsed time since the last run decides due-ness, so a missed tick is
//! caught up on the next one instead of waiting for the next wall-clock
//! boundary.

use chrono::{DateTime, Utc};

use super::model::Quest;

/// Global minimum spacing between two executions of the same quest.
pub fn default_min_spacing() -> chrono::Duration {
    chrono::Duration::minutes(1)
}

/// Whether the ticking loop should run `quest` at `now`.
///
/// Only the cadence and the last execution are considered; the caller
/// filters on status. One-time quests are never due here: they run through
/// explicit activation or the trigger system.
pub fn should_execute(quest: &Quest, now: DateTime<Utc>, min_spacing: chrono::Duration) -> bool {
    let Some(interval) = quest.cadence.interval() else {
        return false;
    };

    match quest.last_executed_at {
        None => true,
        Some(last) => {
            let elapsed = now.signed_duration_since(last);
            elapsed >= min_spacing && elapsed >= interval
        }
    }
}
