pub mod database;
pub mod ledger;
pub mod schedules;
pub mod schema;
pub mod store;
pub mod unit_of_work;

pub use database::Database;
pub use ledger::Ledger;
pub use schedules::Claim;
pub use store::LedgerStore;
pub use unit_of_work::{SequentialUnitOfWork, TransactionalUnitOfWork, UnitOfWork};
