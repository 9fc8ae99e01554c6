//! Cadence advancement.
//!
//! Fixed durations only. A "month" is thirty days.

use crate::types::Cadence;
use chrono::{DateTime, Duration, Utc};

/// Step length for a cadence. Unrecognized cadences step weekly.
pub fn interval(cadence: &Cadence) -> Duration {
    match cadence {
        Cadence::Daily => Duration::days(1),
        Cadence::Weekly => Duration::days(7),
        Cadence::Monthly => Duration::days(30),
        Cadence::Other(_) => Duration::days(7),
    }
}

/// Next run time, anchored on `now`.
pub fn advance(cadence: &Cadence, now: DateTime<Utc>) -> DateTime<Utc> {
    now + interval(cadence)
}
