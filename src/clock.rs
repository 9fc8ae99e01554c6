//! Injectable time and identity sources.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of "now" for timestamps and due checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Produces unique ids for new records.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// ULID-based ids, lexically sortable by creation time.
#[derive(Debug, Default, Clone, Copy)]
pub struct UlidIds;

impl IdGenerator for UlidIds {
    fn next_id(&self) -> String {
        ulid::Ulid::new().to_string()
    }
}
