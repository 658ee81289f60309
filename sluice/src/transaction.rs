//! Transaction orchestration: acquire → begin → execute → commit, with
//! rollback or destroy on mid-flow failure.

use std::fmt;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::warn;

use crate::{
    conn::{Connection, Pool},
    error::{BoxError, DriverError},
    row::Row,
    types::Value,
};

/// Stable code carried by every [`TxError`].
pub const TX_FLOW_FAILURE: &str = "ERR_TX_FLOW_FAILURE";

/// How far a transaction progressed before it ended.
///
/// Each flag is set at most once and never cleared. The state is
/// diagnostic: callers read it to learn whether data was committed,
/// applied-then-reverted, or never touched; it does not drive control flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxState {
    /// The execute stage was entered (a `BEGIN` had succeeded).
    pub started: bool,
    /// The commit completed; the data is durable.
    pub committed: bool,
    /// A rollback completed; the data was reverted.
    pub reverted: bool,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "started={} committed={} reverted={}",
            self.started, self.committed, self.reverted
        )
    }
}

/// Terminal error of a failed transactional run.
///
/// Wraps the primary cause (whatever failed first: begin, the caller's
/// work, or commit) together with a [`TxState`] snapshot. Constructed once
/// and never mutated. Secondary cleanup failures (rollback, destroy) are
/// logged, never substituted for the primary cause.
#[derive(Debug, Error)]
#[error("transaction flow failure ({state}): {source}")]
pub struct TxError {
    state: TxState,
    source: BoxError,
}

impl TxError {
    fn new(source: impl Into<BoxError>, state: TxState) -> Self {
        Self {
            state,
            source: source.into(),
        }
    }

    /// Stable code identifying this failure family.
    pub fn code(&self) -> &'static str {
        TX_FLOW_FAILURE
    }

    /// Snapshot of transaction progress at the time of failure.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// The primary cause, as it was raised.
    pub fn original(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.source.as_ref()
    }
}

/// Outcome signalled by transactional work.
pub type WorkResult = Result<(), BoxError>;

/// Query-execution surface handed to transactional work.
///
/// Exposes statement execution on the borrowed connection only; commit,
/// rollback and release stay with the runner. Starting another transaction
/// through this handle is unsupported; there are no savepoints or nested
/// transactions.
pub struct TxHandle<C: Connection> {
    conn: C,
}

impl<C: Connection> TxHandle<C> {
    /// Execute a statement inside the transaction.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DriverError> {
        self.conn.execute(sql, params).await
    }

    /// Run a query inside the transaction and materialize the result set.
    pub async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DriverError> {
        self.conn.fetch_all(sql, params).await
    }
}

/// Drives one unit of work through the transaction protocol.
///
/// Every stage's failure funnels into the single rollback-or-destroy branch
/// at the bottom; the connection leaves this function through exactly one of
/// release or destroy once it has been acquired.
pub(crate) async fn run<P, W>(pool: &P, work: W) -> Result<(), TxError>
where
    P: Pool,
    W: for<'t> FnOnce(&'t mut TxHandle<P::Conn>) -> BoxFuture<'t, WorkResult> + Send,
{
    let mut state = TxState::default();

    let mut conn = pool
        .acquire()
        .await
        .map_err(|error| TxError::new(error, state))?;

    if let Err(error) = conn.begin().await {
        // A failed BEGIN leaves no session state behind; hand the
        // connection back and let the pool vet it on its next checkout.
        conn.release();
        return Err(TxError::new(error, state));
    }

    state.started = true;

    let mut handle = TxHandle { conn };
    let worked = work(&mut handle).await;
    let mut conn = handle.conn;

    let cause: BoxError = match worked {
        Ok(()) => match conn.commit().await {
            Ok(()) => {
                state.committed = true;
                conn.release();
                return Ok(());
            }
            Err(error) => error.into(),
        },
        Err(error) => error,
    };

    match conn.rollback().await {
        Ok(()) => {
            state.reverted = true;
            conn.release();
        }
        Err(rollback_error) => {
            // Never return a session with a half-open transaction to the
            // pool; the original failure stays the surfaced cause.
            warn!(error = %rollback_error, "rollback failed, destroying connection");
            if let Err(destroy_error) = conn.destroy().await {
                warn!(error = %destroy_error, "failed to destroy connection");
            }
        }
    }

    Err(TxError::new(cause, state))
}
