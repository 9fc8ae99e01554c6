//! Typed ledger operations over a SQLite connection.
//!
//! A [`Ledger`] borrows either the bare connection (every statement commits
//! on its own) or an open transaction. Each mutating method is a single
//! statement, so it is atomic on its own regardless of which one it wraps.

use crate::error::{LedgerError, LedgerResult};
use crate::state::database::{conversion_error, decode_date, decode_ts, encode_ts};
use crate::types::{Badge, Goal, GoalStatus, Profile, Transaction, TxType, XpLogEntry};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::cell::Cell;

const PROFILE_COLUMNS: &str = "id, user_id, xp, level, badges, created_at, updated_at, is_deleted";

const XP_LOG_COLUMNS: &str = "id, user_id, xp_delta, reason, related_entity_type, \
     related_entity_id, created_at, updated_at, is_deleted";

const TRANSACTION_COLUMNS: &str = "id, user_id, type, amount, currency, category, description, \
     occurred_at, created_at, updated_at, is_deleted";

const GOAL_COLUMNS: &str = "id, user_id, name, target_amount, current_amount, deadline, status, \
     created_at, updated_at, is_deleted";

/// Typed operation view over a connection or transaction.
pub struct Ledger<'c> {
    pub(crate) conn: &'c Connection,
    writes: Cell<u32>,
}

impl<'c> Ledger<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            writes: Cell::new(0),
        }
    }

    /// Number of mutating statements that changed at least one row.
    pub fn committed_writes(&self) -> u32 {
        self.writes.get()
    }

    pub(crate) fn record_write(&self) {
        self.writes.set(self.writes.get() + 1);
    }

    // -----------------------------------------------------------------------
    // Profiles
    // -----------------------------------------------------------------------

    /// Live profile for a user.
    pub fn find_profile(&self, user_id: &str) -> LedgerResult<Option<Profile>> {
        let sql = format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = ?1 AND is_deleted = 0"
        );
        let profile = self
            .conn
            .query_row(&sql, params![user_id], profile_from_row)
            .optional()?;
        Ok(profile)
    }

    /// Create an empty profile if the user has none. Never touches an existing one.
    pub fn ensure_profile(
        &self,
        user_id: &str,
        new_id: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<Profile> {
        let ts = encode_ts(&now);
        let inserted = self.conn.execute(
            "INSERT INTO profiles (id, user_id, xp, level, badges, created_at, updated_at, is_deleted)
             VALUES (?1, ?2, 0, 1, '[]', ?3, ?3, 0)
             ON CONFLICT(user_id) WHERE is_deleted = 0 DO NOTHING",
            params![new_id, user_id, ts],
        )?;
        if inserted > 0 {
            self.record_write();
        }
        self.find_profile(user_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("profile for user {user_id}")))
    }

    /// Upsert the profile and add `delta` to its xp in one statement.
    ///
    /// A missing profile is created with `xp = 0, level = 1, badges = []`
    /// before the increment applies. Returns the row as it is after the update.
    pub fn increment_profile_xp(
        &self,
        user_id: &str,
        delta: i64,
        new_id: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<Profile> {
        let sql = format!(
            "INSERT INTO profiles (id, user_id, xp, level, badges, created_at, updated_at, is_deleted)
             VALUES (?1, ?2, ?3, 1, '[]', ?4, ?4, 0)
             ON CONFLICT(user_id) WHERE is_deleted = 0
             DO UPDATE SET xp = xp + excluded.xp, updated_at = excluded.updated_at
             RETURNING {PROFILE_COLUMNS}"
        );
        let profile = self.conn.query_row(
            &sql,
            params![new_id, user_id, delta, encode_ts(&now)],
            profile_from_row,
        )?;
        self.record_write();
        Ok(profile)
    }

    /// Persist a recomputed level.
    pub fn set_profile_level(
        &self,
        profile_id: &str,
        level: i64,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let changed = self.conn.execute(
            "UPDATE profiles SET level = ?2, updated_at = ?3 WHERE id = ?1",
            params![profile_id, level, encode_ts(&now)],
        )?;
        if changed == 0 {
            return Err(LedgerError::NotFound(format!("profile {profile_id}")));
        }
        self.record_write();
        Ok(())
    }

    /// Append a badge unless the profile already holds its code.
    ///
    /// The membership check and the append are one statement, so concurrent
    /// evaluators cannot both append the same code. Returns whether the badge
    /// was added.
    pub fn add_badge(
        &self,
        profile_id: &str,
        badge: &Badge,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let badge_json = serde_json::to_string(badge)
            .map_err(|e| LedgerError::Validation(format!("badge encoding: {e}")))?;
        let changed = self.conn.execute(
            "UPDATE profiles
             SET badges = json_insert(badges, '$[#]', json(?2)), updated_at = ?3
             WHERE id = ?1
               AND NOT EXISTS (
                   SELECT 1 FROM json_each(profiles.badges)
                   WHERE json_extract(json_each.value, '$.code') = ?4
               )",
            params![profile_id, badge_json, encode_ts(&now), badge.code],
        )?;
        if changed > 0 {
            self.record_write();
        }
        Ok(changed > 0)
    }

    // -----------------------------------------------------------------------
    // Experience log
    // -----------------------------------------------------------------------

    pub fn insert_xp_entry(&self, entry: &XpLogEntry) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO xp_log (id, user_id, xp_delta, reason, related_entity_type,
                                 related_entity_id, created_at, updated_at, is_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.id,
                entry.user_id,
                entry.xp_delta,
                entry.reason,
                entry.related_entity_type,
                entry.related_entity_id,
                encode_ts(&entry.created_at),
                encode_ts(&entry.updated_at),
                entry.is_deleted as i32,
            ],
        )?;
        self.record_write();
        Ok(())
    }

    /// Oldest-first log entries for a user, up to `limit`.
    pub fn xp_entries(&self, user_id: &str, limit: usize) -> LedgerResult<Vec<XpLogEntry>> {
        let sql = format!(
            "SELECT {XP_LOG_COLUMNS} FROM xp_log
             WHERE user_id = ?1 AND is_deleted = 0
             ORDER BY created_at, id
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, limit as i64], xp_entry_from_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn count_xp_entries(&self, user_id: &str) -> LedgerResult<u64> {
        let count: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM xp_log WHERE user_id = ?1 AND is_deleted = 0",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn sum_xp_deltas(&self, user_id: &str) -> LedgerResult<i64> {
        let sum: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(xp_delta), 0) FROM xp_log WHERE user_id = ?1 AND is_deleted = 0",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    pub fn insert_transaction(&self, tx: &Transaction) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO transactions (id, user_id, type, amount, currency, category, description,
                                       occurred_at, created_at, updated_at, is_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                tx.id,
                tx.user_id,
                tx.tx_type.to_string(),
                tx.amount,
                tx.currency,
                tx.category,
                tx.description,
                encode_ts(&tx.occurred_at),
                encode_ts(&tx.created_at),
                encode_ts(&tx.updated_at),
                tx.is_deleted as i32,
            ],
        )?;
        self.record_write();
        Ok(())
    }

    pub fn count_transactions(&self, user_id: &str) -> LedgerResult<u64> {
        let count: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM transactions WHERE user_id = ?1 AND is_deleted = 0",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Newest-first transactions for a user.
    pub fn list_transactions(&self, user_id: &str) -> LedgerResult<Vec<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions
             WHERE user_id = ?1 AND is_deleted = 0
             ORDER BY occurred_at DESC, id DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], transaction_from_row)?;

        let mut txs = Vec::new();
        for row in rows {
            txs.push(row?);
        }
        Ok(txs)
    }

    // -----------------------------------------------------------------------
    // Goals
    // -----------------------------------------------------------------------

    pub fn insert_goal(&self, goal: &Goal) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO goals (id, user_id, name, target_amount, current_amount, deadline, status,
                                created_at, updated_at, is_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                goal.id,
                goal.user_id,
                goal.name,
                goal.target_amount,
                goal.current_amount,
                goal.deadline.map(|d| d.format("%Y-%m-%d").to_string()),
                goal.status.to_string(),
                encode_ts(&goal.created_at),
                encode_ts(&goal.updated_at),
                goal.is_deleted as i32,
            ],
        )?;
        self.record_write();
        Ok(())
    }

    pub fn find_goal(&self, goal_id: &str, user_id: &str) -> LedgerResult<Option<Goal>> {
        let sql = format!(
            "SELECT {GOAL_COLUMNS} FROM goals WHERE id = ?1 AND user_id = ?2 AND is_deleted = 0"
        );
        let goal = self
            .conn
            .query_row(&sql, params![goal_id, user_id], goal_from_row)
            .optional()?;
        Ok(goal)
    }

    pub fn count_goals(&self, user_id: &str) -> LedgerResult<u64> {
        let count: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM goals WHERE user_id = ?1 AND is_deleted = 0",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Add `delta` to a live goal's `current_amount`. Returns false if no such goal.
    pub fn increment_goal(
        &self,
        goal_id: &str,
        user_id: &str,
        delta: f64,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let changed = self.conn.execute(
            "UPDATE goals SET current_amount = current_amount + ?3, updated_at = ?4
             WHERE id = ?1 AND user_id = ?2 AND is_deleted = 0",
            params![goal_id, user_id, delta, encode_ts(&now)],
        )?;
        if changed > 0 {
            self.record_write();
        }
        Ok(changed > 0)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    let badges_json: String = row.get(4)?;
    let badges: Vec<Badge> = serde_json::from_str(&badges_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    Ok(Profile {
        id: row.get(0)?,
        user_id: row.get(1)?,
        xp: row.get(2)?,
        level: row.get(3)?,
        badges,
        created_at: decode_ts(5, &row.get::<_, String>(5)?)?,
        updated_at: decode_ts(6, &row.get::<_, String>(6)?)?,
        is_deleted: row.get::<_, i32>(7)? != 0,
    })
}

fn xp_entry_from_row(row: &Row<'_>) -> rusqlite::Result<XpLogEntry> {
    Ok(XpLogEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        xp_delta: row.get(2)?,
        reason: row.get(3)?,
        related_entity_type: row.get(4)?,
        related_entity_id: row.get(5)?,
        created_at: decode_ts(6, &row.get::<_, String>(6)?)?,
        updated_at: decode_ts(7, &row.get::<_, String>(7)?)?,
        is_deleted: row.get::<_, i32>(8)? != 0,
    })
}

pub(crate) fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let tx_type: TxType = row
        .get::<_, String>(2)?
        .parse()
        .map_err(|e| conversion_error(2, e))?;

    Ok(Transaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        tx_type,
        amount: row.get(3)?,
        currency: row.get(4)?,
        category: row.get(5)?,
        description: row.get(6)?,
        occurred_at: decode_ts(7, &row.get::<_, String>(7)?)?,
        created_at: decode_ts(8, &row.get::<_, String>(8)?)?,
        updated_at: decode_ts(9, &row.get::<_, String>(9)?)?,
        is_deleted: row.get::<_, i32>(10)? != 0,
    })
}

fn goal_from_row(row: &Row<'_>) -> rusqlite::Result<Goal> {
    let status: GoalStatus = row
        .get::<_, String>(6)?
        .parse()
        .map_err(|e| conversion_error(6, e))?;

    Ok(Goal {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        target_amount: row.get(3)?,
        current_amount: row.get(4)?,
        deadline: decode_date(5, row.get(5)?)?,
        status,
        created_at: decode_ts(7, &row.get::<_, String>(7)?)?,
        updated_at: decode_ts(8, &row.get::<_, String>(8)?)?,
        is_deleted: row.get::<_, i32>(9)? != 0,
    })
}
