//! Configuration schema for ledger.toml.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Whether award steps run inside a multi-statement transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionPolicy {
    /// Use transactions when the store supports them, otherwise degrade.
    Auto,
    /// Refuse to start without transaction support.
    Required,
    /// Always run steps sequentially.
    Disabled,
}

impl Default for TransactionPolicy {
    fn default() -> Self {
        Self::Auto
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Path to SQLite database.
    pub db_path: String,

    /// Log level (debug, info, warn, error).
    pub log_level: String,

    /// Multi-statement transaction policy, negotiated once at startup.
    pub transactions: TransactionPolicy,

    /// Deadline for a single store call, in milliseconds.
    pub store_timeout_ms: u64,

    /// How long SQLite waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Currency used when a new rule does not name one.
    pub default_currency: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: "~/.questledger/ledger.db".into(),
            log_level: "info".into(),
            transactions: TransactionPolicy::Auto,
            store_timeout_ms: 5_000,
            busy_timeout_ms: 2_000,
            default_currency: "USD".into(),
        }
    }
}

impl LedgerConfig {
    /// Resolve a path that may contain `~` to an absolute path.
    pub fn resolve_path(&self, path: &str) -> String {
        shellexpand::tilde(path).into_owned()
    }

    /// Resolved database path.
    pub fn resolved_db_path(&self) -> String {
        self.resolve_path(&self.db_path)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
