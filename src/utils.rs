//! Small clock helpers for the edges of the system.
//!
//! Event timestamps inside the core are derived from sequence numbers
//! (see [`crate::calc::sequence_to_timestamp`]); the wall clock is only
//! consulted at admission edges and for periodic-scheduler anchors.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn current_time_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
