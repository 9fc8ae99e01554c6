//! QuestLedger: gamified personal-finance ledger core.
//!
//! Experience awards with levels and badges, plus request-driven recurring
//! transactions and savings plans, over a SQLite document store.

pub mod clock;
pub mod config;
pub mod error;
pub mod gamification;
pub mod scheduler;
pub mod state;
pub mod types;
