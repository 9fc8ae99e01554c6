//! Units of work: how a multi-step ledger operation is committed.
//!
//! The implementation is chosen once, when the store is opened, from the
//! configured [`TransactionPolicy`] and a capability check. Callers never
//! retry in the other mode.

use crate::config::TransactionPolicy;
use crate::error::{LedgerError, LedgerResult};
use crate::state::database::Database;
use crate::state::ledger::Ledger;
use crate::types::ConsistencyMode;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Body of a unit of work. Runs against the ledger view the unit provides.
pub type Work<'w> = dyn FnMut(&Ledger<'_>) -> LedgerResult<()> + 'w;

pub trait UnitOfWork: Send + Sync {
    fn mode(&self) -> ConsistencyMode;

    fn execute(&self, db: &mut Database, work: &mut Work<'_>) -> LedgerResult<()>;
}

/// All steps in one SQLite transaction; any error rolls everything back.
#[derive(Debug, Default)]
pub struct TransactionalUnitOfWork;

impl UnitOfWork for TransactionalUnitOfWork {
    fn mode(&self) -> ConsistencyMode {
        ConsistencyMode::Transactional
    }

    fn execute(&self, db: &mut Database, work: &mut Work<'_>) -> LedgerResult<()> {
        let tx = db.transaction()?;
        {
            let ledger = Ledger::new(&tx);
            if let Err(e) = work(&ledger) {
                debug!("Rolling back unit of work: {e}");
                return Err(e);
            }
        }
        tx.commit()?;
        Ok(())
    }
}

/// Steps commit one at a time. Failure after a committed write is reported
/// as [`LedgerError::PartialConsistencyRisk`]; nothing is undone.
#[derive(Debug, Default)]
pub struct SequentialUnitOfWork;

impl UnitOfWork for SequentialUnitOfWork {
    fn mode(&self) -> ConsistencyMode {
        ConsistencyMode::Sequential
    }

    fn execute(&self, db: &mut Database, work: &mut Work<'_>) -> LedgerResult<()> {
        let ledger = db.ledger();
        match work(&ledger) {
            Ok(()) => Ok(()),
            Err(e) if ledger.committed_writes() > 0 => {
                let committed_writes = ledger.committed_writes();
                warn!(
                    committed_writes,
                    error = %e,
                    "Partial consistency risk: sequential unit of work failed after committing writes"
                );
                Err(LedgerError::PartialConsistencyRisk {
                    committed_writes,
                    source: Box::new(e),
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// Negotiate the unit of work for this process.
pub fn select_unit_of_work(
    policy: TransactionPolicy,
    db: &mut Database,
) -> LedgerResult<Arc<dyn UnitOfWork>> {
    let uow: Arc<dyn UnitOfWork> = match policy {
        TransactionPolicy::Disabled => Arc::new(SequentialUnitOfWork),
        TransactionPolicy::Auto => {
            if db.supports_transactions() {
                Arc::new(TransactionalUnitOfWork)
            } else {
                warn!("Store has no transaction support; running in sequential mode");
                Arc::new(SequentialUnitOfWork)
            }
        }
        TransactionPolicy::Required => {
            if !db.supports_transactions() {
                return Err(LedgerError::StoreUnavailable(
                    "multi-statement transactions are required but unsupported".into(),
                ));
            }
            Arc::new(TransactionalUnitOfWork)
        }
    };
    info!("Ledger unit of work: {}", uow.mode());
    Ok(uow)
}
