//! Async handle to the ledger database.
//!
//! SQLite calls are offloaded via `spawn_blocking` so they do not block the
//! async runtime, and every call is bounded by the configured deadline.
//!
//! The deadline covers the wait for the database. A call that has not started
//! when it expires never runs, so `StoreUnavailable` always means nothing was
//! written. A call that already started is waited for and its real result
//! returned.

use crate::config::{LedgerConfig, TransactionPolicy};
use crate::error::{LedgerError, LedgerResult};
use crate::state::database::Database;
use crate::state::ledger::Ledger;
use crate::state::unit_of_work::{select_unit_of_work, UnitOfWork};
use crate::types::ConsistencyMode;
use anyhow::Context;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const ABANDONED: u8 = 2;

/// Decides, exactly once, whether a queued call runs or is abandoned.
#[derive(Default)]
struct StartGate(AtomicU8);

impl StartGate {
    fn start(&self) -> bool {
        self.0
            .compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn abandon(&self) -> bool {
        self.0
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Shared, cloneable store handle. Holds no cached ledger state.
#[derive(Clone)]
pub struct LedgerStore {
    db: Arc<Mutex<Database>>,
    uow: Arc<dyn UnitOfWork>,
    timeout: Duration,
}

impl LedgerStore {
    /// Wrap an open database, negotiating the unit of work once.
    pub fn new(
        mut db: Database,
        policy: TransactionPolicy,
        timeout: Duration,
    ) -> LedgerResult<Self> {
        let uow = select_unit_of_work(policy, &mut db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            uow,
            timeout,
        })
    }

    /// Open the database named by the config.
    pub fn from_config(config: &LedgerConfig) -> anyhow::Result<Self> {
        let db_path = config.resolved_db_path();
        let db = Database::open(Path::new(&db_path), config.busy_timeout())
            .with_context(|| format!("Failed to open database at {db_path}"))?;
        let store = Self::new(db, config.transactions, config.store_timeout())?;
        Ok(store)
    }

    /// The consistency mode every unit of work on this store runs in.
    pub fn mode(&self) -> ConsistencyMode {
        self.uow.mode()
    }

    /// Run read-only work.
    pub async fn read<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&Ledger<'_>) -> LedgerResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.bounded(move |db| f(&db.ledger())).await
    }

    /// Run a single mutating statement outside any unit of work.
    pub async fn write<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&Ledger<'_>) -> LedgerResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.bounded(move |db| f(&db.ledger())).await
    }

    /// Run multi-step work through the negotiated unit of work.
    pub async fn unit_of_work<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&Ledger<'_>) -> LedgerResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let uow = self.uow.clone();
        self.bounded(move |db| {
            let mut work = Some(f);
            let mut output = None;
            uow.execute(db, &mut |ledger: &Ledger<'_>| -> LedgerResult<()> {
                let f = work.take().ok_or_else(|| {
                    LedgerError::StoreUnavailable("unit of work body ran twice".into())
                })?;
                output = Some(f(ledger)?);
                Ok(())
            })?;
            output.ok_or_else(|| {
                LedgerError::StoreUnavailable("unit of work produced no result".into())
            })
        })
        .await
    }

    async fn bounded<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&mut Database) -> LedgerResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let gate = Arc::new(StartGate::default());
        let deadline = Instant::now() + self.timeout;
        let db = self.db.clone();
        let task_gate = gate.clone();
        let timeout = self.timeout;

        let mut handle: JoinHandle<LedgerResult<T>> = tokio::task::spawn_blocking(move || {
            let mut db = db.blocking_lock();
            if Instant::now() >= deadline || !task_gate.start() {
                task_gate.abandon();
                return Err(expired(timeout));
            }
            f(&mut *db)
        });

        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(joined) => joined?,
            Err(_) if gate.abandon() => Err(expired(self.timeout)),
            Err(_) => {
                debug!("Store call passed its deadline after starting; waiting for it");
                handle.await?
            }
        }
    }
}

fn expired(timeout: Duration) -> LedgerError {
    LedgerError::StoreUnavailable(format!(
        "store call did not start within {}ms",
        timeout.as_millis()
    ))
}
