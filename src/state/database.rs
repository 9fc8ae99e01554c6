//! SQLite database handle with WAL mode and migration support.
//!
//! Also owns the timestamp encoding used for every stored temporal value.

use crate::state::ledger::Ledger;
use crate::state::schema;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// The ledger database. Owned by the process entry point.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open SQLite database")?;

        // WAL lets readers proceed while a writer holds the lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(busy_timeout)?;

        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Run schema creation and migrations.
    fn migrate(&mut self) -> Result<()> {
        let version = self.schema_version();

        if version == 0 {
            info!("Creating ledger schema v{}", schema::SCHEMA_VERSION);
            self.conn
                .execute_batch(schema::CREATE_SCHEMA)
                .context("Failed to create schema")?;
            self.conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![schema::SCHEMA_VERSION],
            )?;
        } else if version < schema::SCHEMA_VERSION {
            self.conn.execute(
                "UPDATE schema_version SET version = ?1",
                params![schema::SCHEMA_VERSION],
            )?;
        }

        Ok(())
    }

    /// Get the current schema version (0 if uninitialized).
    fn schema_version(&self) -> u32 {
        self.conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .unwrap_or(0)
    }

    /// Check for multi-statement transaction support by opening and rolling
    /// back an empty transaction.
    pub fn supports_transactions(&mut self) -> bool {
        match self.conn.transaction() {
            Ok(tx) => match tx.rollback() {
                Ok(()) => true,
                Err(e) => {
                    warn!("Transaction check rollback failed: {e}");
                    false
                }
            },
            Err(e) => {
                warn!("Transaction check failed: {e}");
                false
            }
        }
    }

    /// A ledger view that commits every statement on its own.
    pub fn ledger(&self) -> Ledger<'_> {
        Ledger::new(&self.conn)
    }

    /// Begin a multi-statement transaction.
    pub fn transaction(&mut self) -> rusqlite::Result<rusqlite::Transaction<'_>> {
        self.conn.transaction()
    }

    /// Raw connection, for tests that need to break the schema on purpose.
    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ---------------------------------------------------------------------------
// Timestamp encoding
// ---------------------------------------------------------------------------

/// Encode a timestamp as fixed-width UTC text.
pub fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp column.
pub(crate) fn decode_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn decode_date(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<NaiveDate>> {
    raw.map(|s| {
        NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

pub(crate) fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    #[test]
    fn test_open_memory_creates_schema() {
        let db = Database::open_memory().unwrap();
        assert_eq!(db.schema_version(), schema::SCHEMA_VERSION);
    }

    #[test]
    fn test_open_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("ledger.db");
        {
            let _db = Database::open(&path, Duration::from_millis(100)).unwrap();
        }
        let db = Database::open(&path, Duration::from_millis(100)).unwrap();
        assert_eq!(db.schema_version(), schema::SCHEMA_VERSION);
    }

    #[test]
    fn test_sqlite_supports_transactions() {
        let mut db = Database::open_memory().unwrap();
        assert!(db.supports_transactions());
    }

    #[test]
    fn test_encoded_timestamps_sort_chronologically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 59).unwrap();
        let b = a + ChronoDuration::microseconds(1);
        let c = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        assert!(encode_ts(&a) < encode_ts(&b));
        assert!(encode_ts(&b) < encode_ts(&c));
        assert_eq!(encode_ts(&c), "2026-01-10T00:00:00.000000Z");
        assert_eq!(decode_ts(0, &encode_ts(&b)).unwrap(), b);
    }
}
