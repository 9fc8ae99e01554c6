//! Request-driven scheduling of recurring transactions and savings plans.
//!
//! Nothing here runs on a timer. Due items are processed only when a caller
//! asks, and the store is the sole coordination point between callers.

pub mod cadence;
pub mod recurring;

pub use cadence::advance;
pub use recurring::{
    ItemFailure, NewRecurringRule, NewSavingsPlan, RecurringBatch, RecurringRun,
    RecurringScheduler, SavingsBatch, SavingsContribution,
};
