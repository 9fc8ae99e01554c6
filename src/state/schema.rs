//! Database schema definitions and migrations.
//!
//! Timestamps are fixed-width UTC text (`YYYY-MM-DDTHH:MM:SS.ffffffZ`) so
//! that `<=` on the column is a chronological comparison.

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Full DDL for the ledger database.
pub const CREATE_SCHEMA: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

-- Gamification profiles (one live profile per user)
CREATE TABLE IF NOT EXISTS profiles (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL,
    xp          INTEGER NOT NULL DEFAULT 0,
    level       INTEGER NOT NULL DEFAULT 1,
    badges      TEXT NOT NULL DEFAULT '[]',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    is_deleted  INTEGER NOT NULL DEFAULT 0
);

-- Append-only experience log
CREATE TABLE IF NOT EXISTS xp_log (
    id                  TEXT PRIMARY KEY,
    user_id             TEXT NOT NULL,
    xp_delta            INTEGER NOT NULL,
    reason              TEXT NOT NULL,
    related_entity_type TEXT,
    related_entity_id   TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    is_deleted          INTEGER NOT NULL DEFAULT 0
);

-- Financial transactions
CREATE TABLE IF NOT EXISTS transactions (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL,
    type        TEXT NOT NULL DEFAULT 'expense',
    amount      REAL NOT NULL,
    currency    TEXT NOT NULL DEFAULT 'USD',
    category    TEXT,
    description TEXT,
    occurred_at TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    is_deleted  INTEGER NOT NULL DEFAULT 0
);

-- Savings goals
CREATE TABLE IF NOT EXISTS goals (
    id             TEXT PRIMARY KEY,
    user_id        TEXT NOT NULL,
    name           TEXT NOT NULL,
    target_amount  REAL NOT NULL,
    current_amount REAL NOT NULL DEFAULT 0,
    deadline       TEXT,
    status         TEXT NOT NULL DEFAULT 'active',
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    is_deleted     INTEGER NOT NULL DEFAULT 0
);

-- Recurring transaction rules
CREATE TABLE IF NOT EXISTS recurring_rules (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL,
    name        TEXT NOT NULL,
    amount      REAL NOT NULL,
    currency    TEXT NOT NULL DEFAULT 'USD',
    category    TEXT,
    description TEXT,
    type        TEXT NOT NULL DEFAULT 'expense',
    cadence     TEXT NOT NULL DEFAULT 'monthly',
    next_run    TEXT NOT NULL,
    active      INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    is_deleted  INTEGER NOT NULL DEFAULT 0
);

-- Savings contribution plans
CREATE TABLE IF NOT EXISTS savings_plans (
    id                  TEXT PRIMARY KEY,
    user_id             TEXT NOT NULL,
    goal_id             TEXT NOT NULL,
    amount_per_interval REAL NOT NULL,
    interval            TEXT NOT NULL DEFAULT 'monthly',
    next_run            TEXT NOT NULL,
    active              INTEGER NOT NULL DEFAULT 1,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    is_deleted          INTEGER NOT NULL DEFAULT 0
);

-- Indexes
CREATE UNIQUE INDEX IF NOT EXISTS idx_profiles_live_user ON profiles(user_id) WHERE is_deleted = 0;
CREATE INDEX IF NOT EXISTS idx_xp_log_user_created ON xp_log(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id);
CREATE INDEX IF NOT EXISTS idx_goals_user ON goals(user_id);
CREATE INDEX IF NOT EXISTS idx_recurring_due ON recurring_rules(user_id, active, next_run);
CREATE INDEX IF NOT EXISTS idx_savings_due ON savings_plans(user_id, active, next_run);
"#;
