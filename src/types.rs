//! Shared types used across the ledger and the scheduler.
//!
//! These are the persisted record shapes. Field names match the stored
//! column names, so anything serialized from here is wire-compatible with
//! existing data.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Gamification
// ---------------------------------------------------------------------------

/// One-time achievement marker. Codes are unique within a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
    pub code: String,
    pub awarded_at: DateTime<Utc>,
}

/// Per-user gamification state, derived from the experience log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub user_id: String,
    pub xp: i64,
    pub level: i64,
    pub badges: Vec<Badge>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

/// Immutable entry in the append-only experience log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XpLogEntry {
    pub id: String,
    pub user_id: String,
    pub xp_delta: i64,
    pub reason: String,
    #[serde(default)]
    pub related_entity_type: Option<String>,
    #[serde(default)]
    pub related_entity_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

// ---------------------------------------------------------------------------
// Consistency mode
// ---------------------------------------------------------------------------

/// How a unit of work was executed against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// All steps committed or rolled back together.
    Transactional,
    /// Steps committed one by one; a mid-way failure leaves earlier steps in place.
    Sequential,
}

impl fmt::Display for ConsistencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transactional => write!(f, "transactional"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

// ---------------------------------------------------------------------------
// Cadence
// ---------------------------------------------------------------------------

/// Recurrence period for a rule or plan.
///
/// Unknown values are kept verbatim so existing records round-trip; they
/// advance on the weekly default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Cadence {
    Daily,
    Weekly,
    Monthly,
    Other(String),
}

impl Cadence {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Other(raw) => raw,
        }
    }
}

impl Default for Cadence {
    fn default() -> Self {
        Self::Monthly
    }
}

impl From<&str> for Cadence {
    fn from(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "daily" => Self::Daily,
            "weekly" => Self::Weekly,
            "monthly" => Self::Monthly,
            _ => Self::Other(raw.to_string()),
        }
    }
}

impl From<String> for Cadence {
    fn from(raw: String) -> Self {
        Self::from(raw.as_str())
    }
}

impl From<Cadence> for String {
    fn from(cadence: Cadence) -> Self {
        cadence.as_str().to_string()
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Income,
    Expense,
}

impl Default for TxType {
    fn default() -> Self {
        Self::Expense
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Income => write!(f, "income"),
            Self::Expense => write!(f, "expense"),
        }
    }
}

impl FromStr for TxType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "income" => Ok(Self::Income),
            "expense" => Ok(Self::Expense),
            other => Err(format!("unknown transaction type '{other}'")),
        }
    }
}

/// A financial transaction. Owned by the record layer once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub tx_type: TxType,
    pub amount: f64,
    pub currency: String,
    pub category: Option<String>,
    pub description: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

// ---------------------------------------------------------------------------
// Goals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    Active,
    Paused,
    Completed,
    Archived,
}

impl Default for GoalStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

impl FromStr for GoalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown goal status '{other}'")),
        }
    }
}

/// A savings goal. The scheduler only ever increments `current_amount`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub target_amount: f64,
    pub current_amount: f64,
    pub deadline: Option<NaiveDate>,
    pub status: GoalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

// ---------------------------------------------------------------------------
// Recurring obligations
// ---------------------------------------------------------------------------

/// Template that materializes a [`Transaction`] on every due occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringRule {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub amount: f64,
    pub currency: String,
    pub category: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub tx_type: TxType,
    pub cadence: Cadence,
    pub next_run: DateTime<Utc>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

/// Periodic contribution into a [`Goal`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavingsPlan {
    pub id: String,
    pub user_id: String,
    pub goal_id: String,
    pub amount_per_interval: f64,
    pub interval: Cadence,
    pub next_run: DateTime<Utc>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cadence_parsing_is_lenient() {
        assert_eq!(Cadence::from("Daily"), Cadence::Daily);
        assert_eq!(Cadence::from(" weekly "), Cadence::Weekly);
        assert_eq!(Cadence::from("MONTHLY"), Cadence::Monthly);
        assert_eq!(
            Cadence::from("fortnightly"),
            Cadence::Other("fortnightly".into())
        );
        assert_eq!(Cadence::Other("bogus".into()).to_string(), "bogus");
    }

    #[test]
    fn test_transaction_serializes_type_field() {
        let now = Utc::now();
        let tx = Transaction {
            id: "t1".into(),
            user_id: "u1".into(),
            tx_type: TxType::Income,
            amount: 12.5,
            currency: "USD".into(),
            category: None,
            description: None,
            occurred_at: now,
            created_at: now,
            updated_at: now,
            is_deleted: false,
        };
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["type"], "income");
        assert!(json.get("tx_type").is_none());
    }

    #[test]
    fn test_rule_cadence_round_trips_unknown_value() {
        let json = serde_json::json!("quarterly");
        let cadence: Cadence = serde_json::from_value(json).unwrap();
        assert_eq!(cadence, Cadence::Other("quarterly".into()));
        assert_eq!(serde_json::to_value(&cadence).unwrap(), "quarterly");
    }
}
