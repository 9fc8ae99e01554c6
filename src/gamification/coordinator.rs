//! XP award coordinator.
//!
//! One award is one unit of work: append the log entry, increment the
//! profile, recompute the level, then evaluate badges. Whether those steps
//! commit together depends on the store's negotiated [`ConsistencyMode`],
//! which is reported back with every outcome.

use crate::clock::{Clock, IdGenerator};
use crate::error::{LedgerError, LedgerResult};
use crate::gamification::badges::{BadgeEvaluator, BadgeSnapshot};
use crate::gamification::leveling::level_for;
use crate::state::{Ledger, LedgerStore};
use crate::types::{Badge, ConsistencyMode, Profile, XpLogEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A request to credit (or debit) experience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwardRequest {
    pub user_id: String,
    pub reason: String,
    pub amount: i64,
    #[serde(default)]
    pub related_entity_type: Option<String>,
    #[serde(default)]
    pub related_entity_id: Option<String>,
}

impl AwardRequest {
    pub fn new(user_id: impl Into<String>, reason: impl Into<String>, amount: i64) -> Self {
        Self {
            user_id: user_id.into(),
            reason: reason.into(),
            amount,
            related_entity_type: None,
            related_entity_id: None,
        }
    }

    /// Tie the log entry to the record that earned it.
    pub fn related_to(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.related_entity_type = Some(entity_type.into());
        self.related_entity_id = Some(entity_id.into());
        self
    }
}

/// Result of a successful award.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwardOutcome {
    pub xp_awarded: i64,
    pub total_xp: i64,
    pub new_level: i64,
    pub new_badges: Vec<Badge>,
    pub mode: ConsistencyMode,
    /// Set when badge evaluation failed. The xp and level update still applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge_error: Option<String>,
}

/// Profile xp compared against the experience log it should equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerAudit {
    pub user_id: String,
    pub profile_xp: i64,
    pub logged_xp: i64,
    pub entries: u64,
}

impl LedgerAudit {
    pub fn drift(&self) -> i64 {
        self.profile_xp - self.logged_xp
    }

    pub fn is_consistent(&self) -> bool {
        self.drift() == 0
    }
}

/// Coordinates experience awards against the ledger store.
pub struct XpCoordinator {
    store: LedgerStore,
    badges: Arc<BadgeEvaluator>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl XpCoordinator {
    pub fn new(store: LedgerStore, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            store,
            badges: Arc::new(BadgeEvaluator::default()),
            clock,
            ids,
        }
    }

    /// Replace the badge rule set.
    pub fn with_badges(mut self, evaluator: BadgeEvaluator) -> Self {
        self.badges = Arc::new(evaluator);
        self
    }

    pub fn mode(&self) -> ConsistencyMode {
        self.store.mode()
    }

    /// Award `amount` xp to a user for `reason`.
    pub async fn award_xp(
        &self,
        user_id: &str,
        reason: &str,
        amount: i64,
    ) -> LedgerResult<AwardOutcome> {
        self.award(AwardRequest::new(user_id, reason, amount)).await
    }

    pub async fn award(&self, request: AwardRequest) -> LedgerResult<AwardOutcome> {
        let user_id = require_user(&request.user_id)?;
        let reason = request.reason.trim().to_string();
        if reason.is_empty() {
            return Err(LedgerError::Validation("reason is required".into()));
        }

        let now = self.clock.now();
        let amount = request.amount;
        let entry = XpLogEntry {
            id: self.ids.next_id(),
            user_id: user_id.clone(),
            xp_delta: amount,
            reason,
            related_entity_type: request.related_entity_type,
            related_entity_id: request.related_entity_id,
            created_at: now,
            updated_at: now,
            is_deleted: false,
        };
        let new_profile_id = self.ids.next_id();
        let badges = self.badges.clone();
        let mode = self.store.mode();

        let outcome = self
            .store
            .unit_of_work(move |ledger| {
                ledger.insert_xp_entry(&entry)?;

                let profile = ledger.increment_profile_xp(&user_id, amount, &new_profile_id, now)?;
                let new_level = level_for(profile.xp);
                if new_level != profile.level {
                    ledger.set_profile_level(&profile.id, new_level, now)?;
                }

                let (new_badges, badge_error) = award_badges(ledger, &badges, &user_id, now);
                if let Some(e) = &badge_error {
                    warn!("Badge evaluation failed for {user_id}: {e}");
                }

                Ok(AwardOutcome {
                    xp_awarded: amount,
                    total_xp: profile.xp,
                    new_level,
                    new_badges,
                    mode,
                    badge_error,
                })
            })
            .await?;

        info!(
            "Awarded {} xp ({} mode): total {}, level {}, {} new badge(s)",
            outcome.xp_awarded,
            outcome.mode,
            outcome.total_xp,
            outcome.new_level,
            outcome.new_badges.len()
        );
        Ok(outcome)
    }

    /// Create an empty profile for a new user. Existing profiles are untouched.
    pub async fn ensure_profile(&self, user_id: &str) -> LedgerResult<Profile> {
        let user_id = require_user(user_id)?;
        let new_id = self.ids.next_id();
        let now = self.clock.now();
        self.store
            .write(move |ledger| ledger.ensure_profile(&user_id, &new_id, now))
            .await
    }

    /// The user's live profile.
    pub async fn profile(&self, user_id: &str) -> LedgerResult<Profile> {
        let user_id = require_user(user_id)?;
        self.store
            .read(move |ledger| {
                ledger
                    .find_profile(&user_id)?
                    .ok_or_else(|| LedgerError::NotFound(format!("profile for user {user_id}")))
            })
            .await
    }

    /// Oldest-first experience log, up to `limit` entries.
    pub async fn history(&self, user_id: &str, limit: usize) -> LedgerResult<Vec<XpLogEntry>> {
        let user_id = require_user(user_id)?;
        self.store
            .read(move |ledger| ledger.xp_entries(&user_id, limit))
            .await
    }

    /// Compare the profile's xp with the sum of its log entries.
    pub async fn audit(&self, user_id: &str) -> LedgerResult<LedgerAudit> {
        let user_id = require_user(user_id)?;
        let audit = self
            .store
            .read(move |ledger| {
                let profile_xp = ledger.find_profile(&user_id)?.map(|p| p.xp).unwrap_or(0);
                Ok(LedgerAudit {
                    profile_xp,
                    logged_xp: ledger.sum_xp_deltas(&user_id)?,
                    entries: ledger.count_xp_entries(&user_id)?,
                    user_id,
                })
            })
            .await?;

        if !audit.is_consistent() {
            warn!(
                "Ledger drift for {}: profile xp {} vs logged {}",
                audit.user_id, audit.profile_xp, audit.logged_xp
            );
        }
        Ok(audit)
    }
}

fn require_user(user_id: &str) -> LedgerResult<String> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(LedgerError::Validation("user_id is required".into()));
    }
    Ok(user_id.to_string())
}

/// Evaluate rules against the freshly updated profile and persist new codes.
///
/// Returns every badge appended, even when a later step fails, so persisted
/// badges are always reported.
fn award_badges(
    ledger: &Ledger<'_>,
    evaluator: &BadgeEvaluator,
    user_id: &str,
    now: DateTime<Utc>,
) -> (Vec<Badge>, Option<String>) {
    let mut awarded = Vec::new();
    let error = append_badges(ledger, evaluator, user_id, now, &mut awarded).err();
    (awarded, error.map(|e| e.to_string()))
}

fn append_badges(
    ledger: &Ledger<'_>,
    evaluator: &BadgeEvaluator,
    user_id: &str,
    now: DateTime<Utc>,
    awarded: &mut Vec<Badge>,
) -> LedgerResult<()> {
    let profile = ledger
        .find_profile(user_id)?
        .ok_or_else(|| LedgerError::NotFound(format!("profile for user {user_id}")))?;
    let snapshot = BadgeSnapshot::from_profile(
        &profile,
        ledger.count_transactions(user_id)?,
        ledger.count_goals(user_id)?,
    );

    for code in evaluator.evaluate(&snapshot) {
        let badge = Badge {
            code,
            awarded_at: now,
        };
        // A concurrent award may have appended the same code first
        if ledger.add_badge(&profile.id, &badge, now)? {
            debug!("Badge '{}' awarded to {}", badge.code, user_id);
            awarded.push(badge);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedClock, UlidIds};
    use crate::config::TransactionPolicy;
    use crate::gamification::badges::LevelReached;
    use crate::state::store::tests::hold_lock;
    use crate::state::Database;
    use chrono::TimeZone;
    use std::time::Duration;

    fn coordinator_on(db: Database, policy: TransactionPolicy) -> XpCoordinator {
        let store = LedgerStore::new(db, policy, Duration::from_secs(5)).unwrap();
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap());
        XpCoordinator::new(store, Arc::new(clock), Arc::new(UlidIds))
    }

    fn coordinator(policy: TransactionPolicy) -> XpCoordinator {
        coordinator_on(Database::open_memory().unwrap(), policy)
    }

    #[tokio::test]
    async fn test_first_award_creates_profile() {
        let xp = coordinator(TransactionPolicy::Auto);
        let outcome = xp.award_xp("u1", "signup_bonus", 250).await.unwrap();

        assert_eq!(outcome.xp_awarded, 250);
        assert_eq!(outcome.total_xp, 250);
        assert_eq!(outcome.new_level, 2);
        assert!(outcome.new_badges.is_empty());
        assert_eq!(outcome.mode, ConsistencyMode::Transactional);
        assert!(outcome.badge_error.is_none());

        let profile = xp.profile("u1").await.unwrap();
        assert_eq!(profile.xp, 250);
        assert_eq!(profile.level, 2);
    }

    #[tokio::test]
    async fn test_level_5_badge_awarded_once() {
        let xp = coordinator(TransactionPolicy::Auto);
        xp.award_xp("u1", "a", 50).await.unwrap();
        let outcome = xp.award_xp("u1", "b", 460).await.unwrap();

        assert_eq!(outcome.total_xp, 510);
        assert_eq!(outcome.new_level, 5);
        let codes: Vec<&str> = outcome.new_badges.iter().map(|b| b.code.as_str()).collect();
        assert_eq!(codes, vec!["level_5"]);

        let again = xp.award_xp("u1", "c", 10).await.unwrap();
        assert!(again.new_badges.is_empty());
        assert_eq!(xp.profile("u1").await.unwrap().badges.len(), 1);
    }

    #[tokio::test]
    async fn test_negative_award_lowers_level() {
        let xp = coordinator(TransactionPolicy::Auto);
        xp.award_xp("u1", "bonus", 320).await.unwrap();
        let outcome = xp.award_xp("u1", "correction", -150).await.unwrap();
        assert_eq!(outcome.total_xp, 170);
        assert_eq!(outcome.new_level, 1);
    }

    #[tokio::test]
    async fn test_rejects_blank_user_and_reason() {
        let xp = coordinator(TransactionPolicy::Auto);
        assert!(matches!(
            xp.award_xp("  ", "x", 10).await,
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            xp.award_xp("u1", "", 10).await,
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            xp.profile("u1").await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_related_entity_is_logged() {
        let xp = coordinator(TransactionPolicy::Auto);
        xp.award(AwardRequest::new("u1", "add_transaction", 10).related_to("transaction", "t-9"))
            .await
            .unwrap();

        let history = xp.history("u1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].related_entity_type.as_deref(), Some("transaction"));
        assert_eq!(history[0].related_entity_id.as_deref(), Some("t-9"));
    }

    #[tokio::test]
    async fn test_transactional_failure_rolls_back_log() {
        let db = Database::open_memory().unwrap();
        db.conn().execute_batch("DROP TABLE profiles").unwrap();
        let xp = coordinator_on(db, TransactionPolicy::Auto);

        let err = xp.award_xp("u1", "x", 10).await.unwrap_err();
        assert!(matches!(err, LedgerError::StoreUnavailable(_)));

        let logged = xp.history("u1", 10).await.unwrap();
        assert!(logged.is_empty());
    }

    #[tokio::test]
    async fn test_sequential_failure_surfaces_partial_risk() {
        let db = Database::open_memory().unwrap();
        db.conn().execute_batch("DROP TABLE profiles").unwrap();
        let xp = coordinator_on(db, TransactionPolicy::Disabled);

        let err = xp.award_xp("u1", "x", 10).await.unwrap_err();
        match err {
            LedgerError::PartialConsistencyRisk {
                committed_writes,
                source,
            } => {
                assert_eq!(committed_writes, 1);
                assert!(matches!(*source, LedgerError::StoreUnavailable(_)));
            }
            other => panic!("expected partial consistency risk, got {other:?}"),
        }

        // The log row stays behind
        assert_eq!(xp.history("u1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_badge_failure_does_not_fail_award() {
        let db = Database::open_memory().unwrap();
        db.conn().execute_batch("DROP TABLE goals").unwrap();
        let xp = coordinator_on(db, TransactionPolicy::Auto);

        let outcome = xp.award_xp("u1", "x", 600).await.unwrap();
        assert_eq!(outcome.total_xp, 600);
        assert_eq!(outcome.new_level, 6);
        assert!(outcome.new_badges.is_empty());
        assert!(outcome.badge_error.is_some());
        assert_eq!(xp.profile("u1").await.unwrap().level, 6);
    }

    #[tokio::test]
    async fn test_badges_appended_before_a_failure_are_reported() {
        let db = Database::open_memory().unwrap();
        db.conn()
            .execute_batch(
                "CREATE TRIGGER one_badge_only BEFORE UPDATE OF badges ON profiles
                 WHEN json_array_length(NEW.badges) > 1
                 BEGIN SELECT RAISE(ABORT, 'badge limit'); END;",
            )
            .unwrap();
        let xp = coordinator_on(db, TransactionPolicy::Auto).with_badges(
            BadgeEvaluator::empty()
                .with_rule(LevelReached::new(1))
                .with_rule(LevelReached::new(0)),
        );

        let outcome = xp.award_xp("u1", "x", 10).await.unwrap();
        let codes: Vec<&str> = outcome.new_badges.iter().map(|b| b.code.as_str()).collect();
        assert_eq!(codes, vec!["level_1"]);
        assert!(outcome.badge_error.is_some());

        let stored = xp.profile("u1").await.unwrap();
        assert_eq!(stored.badges.len(), 1);
        assert_eq!(stored.badges[0].code, "level_1");
    }

    #[tokio::test]
    async fn test_timed_out_award_is_not_applied() {
        let store = LedgerStore::new(
            Database::open_memory().unwrap(),
            TransactionPolicy::Auto,
            Duration::from_millis(100),
        )
        .unwrap();
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap());
        let xp = XpCoordinator::new(store.clone(), Arc::new(clock), Arc::new(UlidIds));

        let holder = hold_lock(&store, 400).await;
        let err = xp.award_xp("u1", "x", 10).await.unwrap_err();
        assert!(err.is_transient());
        holder.await.unwrap().unwrap();

        let audit = xp.audit("u1").await.unwrap();
        assert_eq!(audit.profile_xp, 0);
        assert_eq!(audit.entries, 0);

        // Retrying the transient failure applies the award exactly once
        xp.award_xp("u1", "x", 10).await.unwrap();
        let audit = xp.audit("u1").await.unwrap();
        assert_eq!(audit.profile_xp, 10);
        assert_eq!(audit.entries, 1);
    }

    #[tokio::test]
    async fn test_audit_detects_drift() {
        let xp = coordinator(TransactionPolicy::Auto);
        xp.award_xp("u1", "a", 40).await.unwrap();
        xp.award_xp("u1", "b", 60).await.unwrap();

        let audit = xp.audit("u1").await.unwrap();
        assert!(audit.is_consistent());
        assert_eq!(audit.entries, 2);
        assert_eq!(audit.logged_xp, 100);

        // A log row whose profile update never happened
        let now = Utc::now();
        xp.store
            .write(move |ledger| {
                ledger.insert_xp_entry(&XpLogEntry {
                    id: "orphan".into(),
                    user_id: "u1".into(),
                    xp_delta: 25,
                    reason: "orphan".into(),
                    related_entity_type: None,
                    related_entity_id: None,
                    created_at: now,
                    updated_at: now,
                    is_deleted: false,
                })
            })
            .await
            .unwrap();

        let audit = xp.audit("u1").await.unwrap();
        assert_eq!(audit.drift(), -25);
        assert!(!audit.is_consistent());
    }

    #[tokio::test]
    async fn test_ensure_profile_is_lazy_and_stable() {
        let xp = coordinator(TransactionPolicy::Auto);
        let created = xp.ensure_profile("u1").await.unwrap();
        assert_eq!(created.xp, 0);
        assert_eq!(created.level, 1);

        xp.award_xp("u1", "x", 30).await.unwrap();
        let again = xp.ensure_profile("u1").await.unwrap();
        assert_eq!(again.id, created.id);
        assert_eq!(again.xp, 30);
    }
}
