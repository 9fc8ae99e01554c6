//! Experience, levels and badges.

pub mod badges;
pub mod coordinator;
pub mod leveling;

pub use badges::{BadgeEvaluator, BadgeRule, BadgeSnapshot};
pub use coordinator::{AwardOutcome, AwardRequest, LedgerAudit, XpCoordinator};
pub use leveling::level_for;
