//! Badge rules.
//!
//! Each rule is a pure predicate over a [`BadgeSnapshot`]. The evaluator
//! only reports codes the profile does not hold yet, so it never re-awards
//! and never removes.

use crate::types::Profile;
use std::collections::BTreeSet;

/// Point-in-time view of what the rules may inspect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BadgeSnapshot {
    pub held: BTreeSet<String>,
    pub transaction_count: u64,
    pub goal_count: u64,
    pub level: i64,
}

impl BadgeSnapshot {
    pub fn from_profile(profile: &Profile, transaction_count: u64, goal_count: u64) -> Self {
        Self {
            held: profile.badges.iter().map(|b| b.code.clone()).collect(),
            transaction_count,
            goal_count,
            level: profile.level,
        }
    }
}

pub trait BadgeRule: Send + Sync {
    /// Badge code this rule awards.
    fn code(&self) -> &str;

    fn qualifies(&self, snapshot: &BadgeSnapshot) -> bool;
}

/// At least one live transaction.
#[derive(Debug, Default)]
pub struct FirstTransaction;

impl BadgeRule for FirstTransaction {
    fn code(&self) -> &str {
        "first_tx"
    }

    fn qualifies(&self, snapshot: &BadgeSnapshot) -> bool {
        snapshot.transaction_count >= 1
    }
}

/// At least one live goal.
#[derive(Debug, Default)]
pub struct FirstGoal;

impl BadgeRule for FirstGoal {
    fn code(&self) -> &str {
        "first_goal"
    }

    fn qualifies(&self, snapshot: &BadgeSnapshot) -> bool {
        snapshot.goal_count >= 1
    }
}

/// Profile level reached a threshold.
#[derive(Debug)]
pub struct LevelReached {
    code: String,
    level: i64,
}

impl LevelReached {
    pub fn new(level: i64) -> Self {
        Self {
            code: format!("level_{level}"),
            level,
        }
    }
}

impl BadgeRule for LevelReached {
    fn code(&self) -> &str {
        &self.code
    }

    fn qualifies(&self, snapshot: &BadgeSnapshot) -> bool {
        snapshot.level >= self.level
    }
}

/// Ordered rule set.
pub struct BadgeEvaluator {
    rules: Vec<Box<dyn BadgeRule>>,
}

impl BadgeEvaluator {
    /// An evaluator with no rules.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: impl BadgeRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// Codes that qualify now and are not held yet, in rule order.
    pub fn evaluate(&self, snapshot: &BadgeSnapshot) -> Vec<String> {
        let mut awarded: Vec<String> = Vec::new();
        for rule in &self.rules {
            let code = rule.code();
            if snapshot.held.contains(code) || awarded.iter().any(|c| c == code) {
                continue;
            }
            if rule.qualifies(snapshot) {
                awarded.push(code.to_string());
            }
        }
        awarded
    }
}

impl Default for BadgeEvaluator {
    fn default() -> Self {
        Self::empty()
            .with_rule(FirstTransaction)
            .with_rule(FirstGoal)
            .with_rule(LevelReached::new(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(tx: u64, goals: u64, level: i64) -> BadgeSnapshot {
        BadgeSnapshot {
            held: BTreeSet::new(),
            transaction_count: tx,
            goal_count: goals,
            level,
        }
    }

    #[test]
    fn test_fresh_user_earns_nothing() {
        let evaluator = BadgeEvaluator::default();
        assert!(evaluator.evaluate(&snapshot(0, 0, 2)).is_empty());
    }

    #[test]
    fn test_builtin_rules_in_order() {
        let evaluator = BadgeEvaluator::default();
        assert_eq!(
            evaluator.evaluate(&snapshot(3, 1, 5)),
            vec!["first_tx", "first_goal", "level_5"]
        );
        assert_eq!(evaluator.evaluate(&snapshot(0, 0, 9)), vec!["level_5"]);
    }

    #[test]
    fn test_held_codes_are_not_reawarded() {
        let evaluator = BadgeEvaluator::default();
        let snap = snapshot(1, 1, 6);
        let first = evaluator.evaluate(&snap);
        assert_eq!(first.len(), 3);

        let mut after = snap;
        after.held.extend(first);
        assert!(evaluator.evaluate(&after).is_empty());
        assert!(evaluator.evaluate(&after).is_empty());
    }

    #[test]
    fn test_duplicate_rules_yield_one_code() {
        let evaluator = BadgeEvaluator::empty()
            .with_rule(LevelReached::new(5))
            .with_rule(LevelReached::new(5));
        assert_eq!(evaluator.evaluate(&snapshot(0, 0, 5)), vec!["level_5"]);
    }

    #[test]
    fn test_custom_rule_extends_set() {
        struct Saver;
        impl BadgeRule for Saver {
            fn code(&self) -> &str {
                "three_goals"
            }
            fn qualifies(&self, s: &BadgeSnapshot) -> bool {
                s.goal_count >= 3
            }
        }

        let evaluator = BadgeEvaluator::default().with_rule(Saver);
        assert_eq!(
            evaluator.evaluate(&snapshot(0, 3, 1)),
            vec!["first_goal", "three_goals"]
        );
    }
}
