//! Recurring transactions and savings plans.
//!
//! Every occurrence is claimed before it is applied. The claim advances
//! `next_run` conditionally on the value that was read, so two callers racing
//! on the same due item cannot both apply it. If applying fails, the claim is
//! released in the same unit of work and the item stays due.

use crate::clock::IdGenerator;
use crate::error::{LedgerError, LedgerResult};
use crate::scheduler::cadence::advance;
use crate::state::{Claim, LedgerStore};
use crate::types::{Cadence, RecurringRule, SavingsPlan, Transaction, TxType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEFAULT_RULE_NAME: &str = "Recurring";

/// Input for [`RecurringScheduler::register_rule`]. Unset fields take defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRecurringRule {
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "type")]
    pub tx_type: Option<TxType>,
    #[serde(default)]
    pub cadence: Option<Cadence>,
}

/// Input for [`RecurringScheduler::register_plan`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSavingsPlan {
    pub user_id: String,
    pub goal_id: String,
    pub amount_per_interval: f64,
    #[serde(default)]
    pub interval: Option<Cadence>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecurringRun {
    pub rule_id: String,
    pub transaction: Transaction,
    pub next_run: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SavingsContribution {
    pub plan_id: String,
    pub goal_id: String,
    pub amount: f64,
    pub next_run: DateTime<Utc>,
}

/// A due item that could not be applied. It remains due.
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecurringBatch {
    pub processed: usize,
    pub transactions: Vec<Transaction>,
    pub failed: Vec<ItemFailure>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SavingsBatch {
    pub processed: usize,
    pub contributions: Vec<SavingsContribution>,
    pub failed: Vec<ItemFailure>,
}

/// Result of one claim-then-apply unit of work.
enum Step<T> {
    Applied(T),
    /// Applying failed and the claim was given back.
    Released(LedgerError),
    /// Someone else advanced the item first, or it is no longer eligible.
    NotClaimed,
}

impl<T> Step<T> {
    fn into_result(self) -> LedgerResult<Option<T>> {
        match self {
            Step::Applied(value) => Ok(Some(value)),
            Step::Released(e) => Err(e),
            Step::NotClaimed => Ok(None),
        }
    }
}

pub struct RecurringScheduler {
    store: LedgerStore,
    ids: Arc<dyn IdGenerator>,
    default_currency: String,
}

impl RecurringScheduler {
    pub fn new(store: LedgerStore, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            store,
            ids,
            default_currency: "USD".to_string(),
        }
    }

    pub fn with_default_currency(mut self, currency: &str) -> Self {
        self.default_currency = currency.trim().to_uppercase();
        self
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Create an active rule that is due immediately.
    pub async fn register_rule(
        &self,
        input: NewRecurringRule,
        now: DateTime<Utc>,
    ) -> LedgerResult<RecurringRule> {
        let user_id = require_user(&input.user_id)?;
        if !is_positive(input.amount) {
            return Err(LedgerError::Validation("amount must be > 0".into()));
        }

        let name = input
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_RULE_NAME.to_string());
        let currency = input
            .currency
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.default_currency.clone());

        let rule = RecurringRule {
            id: self.ids.next_id(),
            user_id,
            name,
            amount: input.amount,
            currency,
            category: non_empty(input.category),
            description: non_empty(input.description),
            tx_type: input.tx_type.unwrap_or(TxType::Expense),
            cadence: input.cadence.unwrap_or_default(),
            next_run: now,
            active: true,
            created_at: now,
            updated_at: now,
            is_deleted: false,
        };

        let stored = rule.clone();
        self.store
            .write(move |ledger| ledger.insert_recurring_rule(&stored))
            .await?;
        info!("Registered recurring rule {} ({}, {})", rule.id, rule.name, rule.cadence);
        Ok(rule)
    }

    /// Create an active savings plan that is due immediately.
    pub async fn register_plan(
        &self,
        input: NewSavingsPlan,
        now: DateTime<Utc>,
    ) -> LedgerResult<SavingsPlan> {
        let user_id = require_user(&input.user_id)?;
        let goal_id = input.goal_id.trim().to_string();
        if goal_id.is_empty() || !is_positive(input.amount_per_interval) {
            return Err(LedgerError::Validation(
                "goal_id and positive amount_per_interval required".into(),
            ));
        }

        let plan = SavingsPlan {
            id: self.ids.next_id(),
            user_id,
            goal_id,
            amount_per_interval: input.amount_per_interval,
            interval: input.interval.unwrap_or_default(),
            next_run: now,
            active: true,
            created_at: now,
            updated_at: now,
            is_deleted: false,
        };

        let stored = plan.clone();
        self.store
            .write(move |ledger| ledger.insert_savings_plan(&stored))
            .await?;
        info!("Registered savings plan {} for goal {}", plan.id, plan.goal_id);
        Ok(plan)
    }

    pub async fn list_rules(&self, user_id: &str) -> LedgerResult<Vec<RecurringRule>> {
        let user_id = require_user(user_id)?;
        self.store
            .read(move |ledger| ledger.list_recurring_rules(&user_id))
            .await
    }

    pub async fn list_plans(&self, user_id: &str) -> LedgerResult<Vec<SavingsPlan>> {
        let user_id = require_user(user_id)?;
        self.store
            .read(move |ledger| ledger.list_savings_plans(&user_id))
            .await
    }

    // -----------------------------------------------------------------------
    // Recurring rules
    // -----------------------------------------------------------------------

    /// Apply one rule now, whether or not it is due.
    pub async fn run_recurring_now(
        &self,
        rule_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<RecurringRun> {
        let user_id = require_user(user_id)?;
        let (id, owner) = (rule_id.to_string(), user_id.clone());
        let rule = self
            .store
            .read(move |ledger| ledger.find_recurring_rule(&id, &owner))
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("recurring rule {rule_id}")))?;

        if !rule.active {
            return Err(LedgerError::PreconditionFailed(format!(
                "recurring rule {rule_id} is inactive"
            )));
        }

        self.apply_rule(&rule, None, now).await?.ok_or_else(|| {
            LedgerError::PreconditionFailed(format!("recurring rule {rule_id} changed concurrently"))
        })
    }

    /// Apply every active rule due at `now`. Failed rules are skipped and stay due.
    pub async fn run_recurring_due(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<RecurringBatch> {
        let user_id = require_user(user_id)?;
        let owner = user_id.clone();
        let due = self
            .store
            .read(move |ledger| ledger.find_due_recurring_rules(&owner, now))
            .await?;

        let mut batch = RecurringBatch::default();
        for rule in due {
            match self.apply_rule(&rule, Some(now), now).await {
                Ok(Some(run)) => {
                    debug!("Recurring rule {} -> transaction {}", rule.id, run.transaction.id);
                    batch.processed += 1;
                    batch.transactions.push(run.transaction);
                }
                Ok(None) => debug!("Recurring rule {} already claimed", rule.id),
                Err(e) => {
                    warn!("Recurring rule {} failed: {e}", rule.id);
                    batch.failed.push(ItemFailure {
                        id: rule.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Recurring run for {user_id}: {} processed, {} failed",
            batch.processed,
            batch.failed.len()
        );
        Ok(batch)
    }

    async fn apply_rule(
        &self,
        rule: &RecurringRule,
        due_by: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<RecurringRun>> {
        let claim = Claim {
            id: rule.id.clone(),
            user_id: rule.user_id.clone(),
            observed: rule.next_run,
            due_by,
            next_run: advance(&rule.cadence, now),
            at: now,
        };
        let transaction_id = self.ids.next_id();

        let step = self
            .store
            .unit_of_work(move |ledger| {
                let Some(claimed) = ledger.claim_recurring_rule(&claim)? else {
                    return Ok(Step::NotClaimed);
                };
                let transaction = materialize(&claimed, transaction_id, now);
                match ledger.insert_transaction(&transaction) {
                    Ok(()) => Ok(Step::Applied(RecurringRun {
                        rule_id: claimed.id,
                        transaction,
                        next_run: claimed.next_run,
                    })),
                    Err(e) => {
                        ledger.release_recurring_rule(&claim)?;
                        Ok(Step::Released(e))
                    }
                }
            })
            .await?;
        step.into_result()
    }

    // -----------------------------------------------------------------------
    // Savings plans
    // -----------------------------------------------------------------------

    /// Contribute to a plan's goal now, whether or not it is due.
    pub async fn run_savings_now(
        &self,
        plan_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<SavingsContribution> {
        let user_id = require_user(user_id)?;
        let (id, owner) = (plan_id.to_string(), user_id.clone());
        let plan = self
            .store
            .read(move |ledger| ledger.find_savings_plan(&id, &owner))
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("savings plan {plan_id}")))?;

        if !plan.active {
            return Err(LedgerError::PreconditionFailed(format!(
                "savings plan {plan_id} is inactive"
            )));
        }

        self.apply_plan(&plan, None, now).await?.ok_or_else(|| {
            LedgerError::PreconditionFailed(format!("savings plan {plan_id} changed concurrently"))
        })
    }

    /// Contribute for every active plan due at `now`.
    pub async fn run_savings_due(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<SavingsBatch> {
        let user_id = require_user(user_id)?;
        let owner = user_id.clone();
        let due = self
            .store
            .read(move |ledger| ledger.find_due_savings_plans(&owner, now))
            .await?;

        let mut batch = SavingsBatch::default();
        for plan in due {
            match self.apply_plan(&plan, Some(now), now).await {
                Ok(Some(contribution)) => {
                    debug!(
                        "Savings plan {} added {} to goal {}",
                        plan.id, contribution.amount, contribution.goal_id
                    );
                    batch.processed += 1;
                    batch.contributions.push(contribution);
                }
                Ok(None) => debug!("Savings plan {} already claimed", plan.id),
                Err(e) => {
                    warn!("Savings plan {} failed: {e}", plan.id);
                    batch.failed.push(ItemFailure {
                        id: plan.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Savings run for {user_id}: {} processed, {} failed",
            batch.processed,
            batch.failed.len()
        );
        Ok(batch)
    }

    async fn apply_plan(
        &self,
        plan: &SavingsPlan,
        due_by: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<SavingsContribution>> {
        let claim = Claim {
            id: plan.id.clone(),
            user_id: plan.user_id.clone(),
            observed: plan.next_run,
            due_by,
            next_run: advance(&plan.interval, now),
            at: now,
        };

        let step = self
            .store
            .unit_of_work(move |ledger| {
                let Some(claimed) = ledger.claim_savings_plan(&claim)? else {
                    return Ok(Step::NotClaimed);
                };
                let applied = ledger
                    .increment_goal(
                        &claimed.goal_id,
                        &claimed.user_id,
                        claimed.amount_per_interval,
                        now,
                    )
                    .and_then(|found| {
                        if found {
                            Ok(())
                        } else {
                            Err(LedgerError::NotFound(format!("goal {}", claimed.goal_id)))
                        }
                    });
                match applied {
                    Ok(()) => Ok(Step::Applied(SavingsContribution {
                        plan_id: claimed.id,
                        goal_id: claimed.goal_id,
                        amount: claimed.amount_per_interval,
                        next_run: claimed.next_run,
                    })),
                    Err(e) => {
                        ledger.release_savings_plan(&claim)?;
                        Ok(Step::Released(e))
                    }
                }
            })
            .await?;
        step.into_result()
    }
}

/// The transaction a rule produces for one occurrence.
fn materialize(rule: &RecurringRule, id: String, now: DateTime<Utc>) -> Transaction {
    Transaction {
        id,
        user_id: rule.user_id.clone(),
        tx_type: rule.tx_type,
        amount: rule.amount,
        currency: rule.currency.clone(),
        category: rule.category.clone(),
        description: rule.description.clone(),
        occurred_at: now,
        created_at: now,
        updated_at: now,
        is_deleted: false,
    }
}

fn require_user(user_id: &str) -> LedgerResult<String> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(LedgerError::Validation("user_id is required".into()));
    }
    Ok(user_id.to_string())
}

fn is_positive(amount: f64) -> bool {
    amount.is_finite() && amount > 0.0
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::UlidIds;
    use crate::config::TransactionPolicy;
    use crate::state::store::tests::hold_lock;
    use crate::state::Database;
    use crate::types::{Goal, GoalStatus};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap()
    }

    fn scheduler_on(db: Database, policy: TransactionPolicy) -> RecurringScheduler {
        let store = LedgerStore::new(db, policy, std::time::Duration::from_secs(5)).unwrap();
        RecurringScheduler::new(store, Arc::new(UlidIds))
    }

    fn scheduler() -> RecurringScheduler {
        scheduler_on(Database::open_memory().unwrap(), TransactionPolicy::Auto)
    }

    fn rent() -> NewRecurringRule {
        NewRecurringRule {
            user_id: "u1".into(),
            name: Some("Rent".into()),
            amount: 1200.0,
            currency: Some("eur".into()),
            category: Some("housing".into()),
            cadence: Some(Cadence::Monthly),
            ..Default::default()
        }
    }

    async fn add_goal(s: &RecurringScheduler, id: &str) {
        let goal = Goal {
            id: id.into(),
            user_id: "u1".into(),
            name: "Trip".into(),
            target_amount: 1000.0,
            current_amount: 0.0,
            deadline: None,
            status: GoalStatus::Active,
            created_at: t0(),
            updated_at: t0(),
            is_deleted: false,
        };
        s.store.write(move |l| l.insert_goal(&goal)).await.unwrap();
    }

    #[tokio::test]
    async fn test_register_rule_applies_defaults() {
        let s = scheduler();
        let rule = s
            .register_rule(
                NewRecurringRule {
                    user_id: "u1".into(),
                    name: Some("  ".into()),
                    amount: 9.99,
                    cadence: Some(Cadence::from("Weekly")),
                    ..Default::default()
                },
                t0(),
            )
            .await
            .unwrap();

        assert_eq!(rule.name, "Recurring");
        assert_eq!(rule.currency, "USD");
        assert_eq!(rule.tx_type, TxType::Expense);
        assert_eq!(rule.cadence, Cadence::Weekly);
        assert_eq!(rule.next_run, t0());
        assert!(rule.active);
    }

    #[tokio::test]
    async fn test_register_rejects_non_positive_amounts() {
        let s = scheduler();
        for amount in [0.0, -5.0, f64::NAN] {
            let err = s
                .register_rule(NewRecurringRule { amount, ..rent() }, t0())
                .await
                .unwrap_err();
            assert!(matches!(err, LedgerError::Validation(_)));
        }

        let err = s
            .register_plan(
                NewSavingsPlan {
                    user_id: "u1".into(),
                    goal_id: "".into(),
                    amount_per_interval: 10.0,
                    interval: None,
                },
                t0(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_run_now_creates_transaction_and_advances() {
        let s = scheduler();
        let rule = s.register_rule(rent(), t0()).await.unwrap();

        let later = t0() + Duration::hours(2);
        let run = s.run_recurring_now(&rule.id, "u1", later).await.unwrap();
        assert_eq!(run.transaction.amount, 1200.0);
        assert_eq!(run.transaction.currency, "EUR");
        assert_eq!(run.transaction.category.as_deref(), Some("housing"));
        assert_eq!(run.transaction.occurred_at, later);
        assert_eq!(run.next_run, later + Duration::days(30));

        // Not due any more, but run_now ignores that
        let again = s.run_recurring_now(&rule.id, "u1", later).await.unwrap();
        assert_eq!(again.next_run, later + Duration::days(30));
    }

    #[tokio::test]
    async fn test_run_now_unknown_and_foreign_rule() {
        let s = scheduler();
        let rule = s.register_rule(rent(), t0()).await.unwrap();

        assert!(matches!(
            s.run_recurring_now("missing", "u1", t0()).await,
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            s.run_recurring_now(&rule.id, "u2", t0()).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_due_anchors_on_batch_time() {
        let s = scheduler();
        let rule = s.register_rule(rent(), t0()).await.unwrap();

        let now = t0() + Duration::days(3);
        let batch = s.run_recurring_due("u1", now).await.unwrap();
        assert_eq!(batch.processed, 1);

        let rules = s.list_rules("u1").await.unwrap();
        assert_eq!(rules[0].id, rule.id);
        assert_eq!(rules[0].next_run, now + Duration::days(30));
    }

    #[tokio::test]
    async fn test_failed_insert_releases_claim_without_partial_risk() {
        let db = Database::open_memory().unwrap();
        db.conn().execute_batch("DROP TABLE transactions").unwrap();
        let s = scheduler_on(db, TransactionPolicy::Disabled);
        let rule = s.register_rule(rent(), t0()).await.unwrap();

        let batch = s.run_recurring_due("u1", t0()).await.unwrap();
        assert_eq!(batch.processed, 0);
        assert_eq!(batch.failed.len(), 1);
        assert_eq!(batch.failed[0].id, rule.id);

        let stored = s.list_rules("u1").await.unwrap();
        assert_eq!(stored[0].next_run, t0());

        let err = s.run_recurring_now(&rule.id, "u1", t0()).await.unwrap_err();
        assert!(matches!(err, LedgerError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_savings_contributes_to_goal() {
        let s = scheduler();
        add_goal(&s, "g1").await;
        let plan = s
            .register_plan(
                NewSavingsPlan {
                    user_id: "u1".into(),
                    goal_id: "g1".into(),
                    amount_per_interval: 50.0,
                    interval: Some(Cadence::Weekly),
                },
                t0(),
            )
            .await
            .unwrap();

        let first = s.run_savings_due("u1", t0()).await.unwrap();
        assert_eq!(first.processed, 1);
        assert_eq!(first.contributions[0].next_run, t0() + Duration::days(7));
        assert_eq!(s.run_savings_due("u1", t0()).await.unwrap().processed, 0);

        s.run_savings_now(&plan.id, "u1", t0()).await.unwrap();
        let goal = s
            .store
            .read(|l| l.find_goal("g1", "u1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(goal.current_amount, 100.0);
    }

    #[tokio::test]
    async fn test_missing_goal_is_isolated() {
        let s = scheduler();
        add_goal(&s, "g1").await;
        let good = s
            .register_plan(
                NewSavingsPlan {
                    user_id: "u1".into(),
                    goal_id: "g1".into(),
                    amount_per_interval: 20.0,
                    interval: None,
                },
                t0(),
            )
            .await
            .unwrap();
        let orphan = s
            .register_plan(
                NewSavingsPlan {
                    user_id: "u1".into(),
                    goal_id: "gone".into(),
                    amount_per_interval: 20.0,
                    interval: None,
                },
                t0(),
            )
            .await
            .unwrap();

        let batch = s.run_savings_due("u1", t0()).await.unwrap();
        assert_eq!(batch.processed, 1);
        assert_eq!(batch.contributions[0].plan_id, good.id);
        assert_eq!(batch.failed.len(), 1);
        assert_eq!(batch.failed[0].id, orphan.id);

        // The orphan is still due
        let plans = s.list_plans("u1").await.unwrap();
        let stored = plans.iter().find(|p| p.id == orphan.id).unwrap();
        assert_eq!(stored.next_run, t0());

        assert!(matches!(
            s.run_savings_now(&orphan.id, "u1", t0()).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_inactive_plan_is_refused_without_mutation() {
        let s = scheduler();
        add_goal(&s, "g1").await;
        let paused = SavingsPlan {
            id: "paused".into(),
            user_id: "u1".into(),
            goal_id: "g1".into(),
            amount_per_interval: 25.0,
            interval: Cadence::Weekly,
            next_run: t0(),
            active: false,
            created_at: t0(),
            updated_at: t0(),
            is_deleted: false,
        };
        s.store
            .write(move |l| l.insert_savings_plan(&paused))
            .await
            .unwrap();

        let err = s.run_savings_now("paused", "u1", t0()).await.unwrap_err();
        assert!(matches!(err, LedgerError::PreconditionFailed(_)));

        let plan = s
            .store
            .read(|l| l.find_savings_plan("paused", "u1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plan.next_run, t0());
        assert_eq!(plan.updated_at, t0());
        let goal = s
            .store
            .read(|l| l.find_goal("g1", "u1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(goal.current_amount, 0.0);

        let batch = s.run_savings_due("u1", t0()).await.unwrap();
        assert_eq!(batch.processed, 0);
        assert!(batch.failed.is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_claim_does_not_advance() {
        let store = LedgerStore::new(
            Database::open_memory().unwrap(),
            TransactionPolicy::Auto,
            std::time::Duration::from_millis(100),
        )
        .unwrap();
        let s = RecurringScheduler::new(store.clone(), Arc::new(UlidIds));
        let rule = s.register_rule(rent(), t0()).await.unwrap();

        let holder = hold_lock(&store, 400).await;
        let err = s.apply_rule(&rule, Some(t0()), t0()).await.unwrap_err();
        assert!(matches!(err, LedgerError::StoreUnavailable(_)));
        holder.await.unwrap().unwrap();

        let rules = s.list_rules("u1").await.unwrap();
        assert_eq!(rules[0].next_run, t0());
        assert!(store
            .read(|l| l.list_transactions("u1"))
            .await
            .unwrap()
            .is_empty());

        // Still due, so the next batch applies it once
        let batch = s
            .run_recurring_due("u1", t0() + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(batch.processed, 1);
    }
}
