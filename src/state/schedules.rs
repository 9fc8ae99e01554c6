//! Recurring rule and savings plan operations.
//!
//! Advancing `next_run` always goes through a [`Claim`]: a compare-and-swap
//! on the `next_run` value the caller observed. Only one caller can win a
//! given occurrence, and the winner gets the claimed row back.

use crate::error::LedgerResult;
use crate::state::database::{conversion_error, decode_ts, encode_ts};
use crate::state::ledger::Ledger;
use crate::types::{Cadence, RecurringRule, SavingsPlan, TxType};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const RULE_COLUMNS: &str = "id, user_id, name, amount, currency, category, description, type, \
     cadence, next_run, active, created_at, updated_at, is_deleted";

const PLAN_COLUMNS: &str = "id, user_id, goal_id, amount_per_interval, interval, next_run, \
     active, created_at, updated_at, is_deleted";

/// A conditional advance of one rule's or plan's `next_run`.
#[derive(Debug, Clone)]
pub struct Claim {
    pub id: String,
    pub user_id: String,
    /// The `next_run` the caller read. The claim fails if it has changed since.
    pub observed: DateTime<Utc>,
    /// When set, the stored `next_run` must also be at or before this instant.
    pub due_by: Option<DateTime<Utc>>,
    /// Value written on success.
    pub next_run: DateTime<Utc>,
    pub at: DateTime<Utc>,
}

impl<'c> Ledger<'c> {
    // -----------------------------------------------------------------------
    // Recurring rules
    // -----------------------------------------------------------------------

    pub fn insert_recurring_rule(&self, rule: &RecurringRule) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO recurring_rules (id, user_id, name, amount, currency, category, description,
                                          type, cadence, next_run, active, created_at, updated_at,
                                          is_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                rule.id,
                rule.user_id,
                rule.name,
                rule.amount,
                rule.currency,
                rule.category,
                rule.description,
                rule.tx_type.to_string(),
                rule.cadence.as_str(),
                encode_ts(&rule.next_run),
                rule.active as i32,
                encode_ts(&rule.created_at),
                encode_ts(&rule.updated_at),
                rule.is_deleted as i32,
            ],
        )?;
        self.record_write();
        Ok(())
    }

    pub fn find_recurring_rule(
        &self,
        rule_id: &str,
        user_id: &str,
    ) -> LedgerResult<Option<RecurringRule>> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM recurring_rules
             WHERE id = ?1 AND user_id = ?2 AND is_deleted = 0"
        );
        let rule = self
            .conn
            .query_row(&sql, params![rule_id, user_id], rule_from_row)
            .optional()?;
        Ok(rule)
    }

    /// Every live rule for a user, including paused ones.
    pub fn list_recurring_rules(&self, user_id: &str) -> LedgerResult<Vec<RecurringRule>> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM recurring_rules
             WHERE user_id = ?1 AND is_deleted = 0
             ORDER BY created_at, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], rule_from_row)?;

        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }

    /// Active rules whose `next_run` is at or before `now`, oldest first.
    pub fn find_due_recurring_rules(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<Vec<RecurringRule>> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM recurring_rules
             WHERE user_id = ?1 AND active = 1 AND is_deleted = 0 AND next_run <= ?2
             ORDER BY next_run, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, encode_ts(&now)], rule_from_row)?;

        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }

    /// Advance an active rule's `next_run` if the claim still holds.
    pub fn claim_recurring_rule(&self, claim: &Claim) -> LedgerResult<Option<RecurringRule>> {
        self.claim_row("recurring_rules", RULE_COLUMNS, claim, rule_from_row)
    }

    /// Undo a claim whose side effect could not be applied.
    pub fn release_recurring_rule(&self, claim: &Claim) -> LedgerResult<bool> {
        self.release("recurring_rules", claim)
    }

    // -----------------------------------------------------------------------
    // Savings plans
    // -----------------------------------------------------------------------

    pub fn insert_savings_plan(&self, plan: &SavingsPlan) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO savings_plans (id, user_id, goal_id, amount_per_interval, interval, next_run,
                                        active, created_at, updated_at, is_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                plan.id,
                plan.user_id,
                plan.goal_id,
                plan.amount_per_interval,
                plan.interval.as_str(),
                encode_ts(&plan.next_run),
                plan.active as i32,
                encode_ts(&plan.created_at),
                encode_ts(&plan.updated_at),
                plan.is_deleted as i32,
            ],
        )?;
        self.record_write();
        Ok(())
    }

    pub fn find_savings_plan(
        &self,
        plan_id: &str,
        user_id: &str,
    ) -> LedgerResult<Option<SavingsPlan>> {
        let sql = format!(
            "SELECT {PLAN_COLUMNS} FROM savings_plans
             WHERE id = ?1 AND user_id = ?2 AND is_deleted = 0"
        );
        let plan = self
            .conn
            .query_row(&sql, params![plan_id, user_id], plan_from_row)
            .optional()?;
        Ok(plan)
    }

    pub fn list_savings_plans(&self, user_id: &str) -> LedgerResult<Vec<SavingsPlan>> {
        let sql = format!(
            "SELECT {PLAN_COLUMNS} FROM savings_plans
             WHERE user_id = ?1 AND is_deleted = 0
             ORDER BY created_at, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], plan_from_row)?;
        let plans = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(plans)
    }

    pub fn find_due_savings_plans(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<Vec<SavingsPlan>> {
        let sql = format!(
            "SELECT {PLAN_COLUMNS} FROM savings_plans
             WHERE user_id = ?1 AND active = 1 AND is_deleted = 0 AND next_run <= ?2
             ORDER BY next_run, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, encode_ts(&now)], plan_from_row)?;

        let mut plans = Vec::new();
        for row in rows {
            plans.push(row?);
        }
        Ok(plans)
    }

    pub fn claim_savings_plan(&self, claim: &Claim) -> LedgerResult<Option<SavingsPlan>> {
        self.claim_row("savings_plans", PLAN_COLUMNS, claim, plan_from_row)
    }

    pub fn release_savings_plan(&self, claim: &Claim) -> LedgerResult<bool> {
        self.release("savings_plans", claim)
    }

    fn claim_row<T>(
        &self,
        table: &str,
        columns: &str,
        claim: &Claim,
        map: fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> LedgerResult<Option<T>> {
        let sql = format!(
            "UPDATE {table} SET next_run = ?4, updated_at = ?5
             WHERE id = ?1 AND user_id = ?2 AND active = 1 AND is_deleted = 0
               AND next_run = ?3
               AND (?6 IS NULL OR next_run <= ?6)
             RETURNING {columns}"
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![
                    claim.id,
                    claim.user_id,
                    encode_ts(&claim.observed),
                    encode_ts(&claim.next_run),
                    encode_ts(&claim.at),
                    claim.due_by.as_ref().map(encode_ts),
                ],
                map,
            )
            .optional()?;
        if row.is_some() {
            self.record_write();
        }
        Ok(row)
    }

    fn release(&self, table: &str, claim: &Claim) -> LedgerResult<bool> {
        let sql = format!(
            "UPDATE {table} SET next_run = ?3, updated_at = ?4
             WHERE id = ?1 AND next_run = ?2"
        );
        let changed = self.conn.execute(
            &sql,
            params![
                claim.id,
                encode_ts(&claim.next_run),
                encode_ts(&claim.observed),
                encode_ts(&claim.at),
            ],
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

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<RecurringRule> {
    let tx_type: TxType = row
        .get::<_, String>(7)?
        .parse()
        .map_err(|e| conversion_error(7, e))?;

    Ok(RecurringRule {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        amount: row.get(3)?,
        currency: row.get(4)?,
        category: row.get(5)?,
        description: row.get(6)?,
        tx_type,
        cadence: Cadence::from(row.get::<_, String>(8)?),
        next_run: decode_ts(9, &row.get::<_, String>(9)?)?,
        active: row.get::<_, i32>(10)? != 0,
        created_at: decode_ts(11, &row.get::<_, String>(11)?)?,
        updated_at: decode_ts(12, &row.get::<_, String>(12)?)?,
        is_deleted: row.get::<_, i32>(13)? != 0,
    })
}

fn plan_from_row(row: &Row<'_>) -> rusqlite::Result<SavingsPlan> {
    Ok(SavingsPlan {
        id: row.get(0)?,
        user_id: row.get(1)?,
        goal_id: row.get(2)?,
        amount_per_interval: row.get(3)?,
        interval: Cadence::from(row.get::<_, String>(4)?),
        next_run: decode_ts(5, &row.get::<_, String>(5)?)?,
        active: row.get::<_, i32>(6)? != 0,
        created_at: decode_ts(7, &row.get::<_, String>(7)?)?,
        updated_at: decode_ts(8, &row.get::<_, String>(8)?)?,
        is_deleted: row.get::<_, i32>(9)? != 0,
    })
}
