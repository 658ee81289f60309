//! Connection pool and connection seams.
//!
//! The runner and the stream iterator are written against these traits; the
//! PostgreSQL backend is the production implementation and the in-memory
//! backend is a deterministic double for tests and examples.

mod memory;
mod postgres;

use async_trait::async_trait;
pub use memory::{MemoryConnection, MemoryCursor, MemoryPool, OpCounts};
pub use postgres::{PgConn, PgConnPool, PgRowCursor};

use crate::{error::DriverError, row::Row, types::Value};

/// Hands out exclusive connection handles and accepts their return.
#[async_trait]
pub trait Pool: Send + Sync {
    type Conn: Connection;

    /// Borrow an exclusive connection from the pool.
    async fn acquire(&self) -> Result<Self::Conn, DriverError>;

    /// Connections currently checked out of the pool.
    fn active(&self) -> u32;
}

/// An exclusively-owned connection borrowed from a [`Pool`].
///
/// Exactly one of [`release`](Connection::release),
/// [`destroy`](Connection::destroy) or a cursor close must eventually run
/// for every acquired connection; ownership makes double-return
/// unrepresentable.
#[async_trait]
pub trait Connection: Send + Sized + 'static {
    type Cursor: RowCursor;

    /// Open a transaction on this connection.
    async fn begin(&mut self) -> Result<(), DriverError>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> Result<(), DriverError>;

    /// Roll the open transaction back.
    async fn rollback(&mut self) -> Result<(), DriverError>;

    /// Execute a statement, returning the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DriverError>;

    /// Run a query and materialize the whole result set.
    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DriverError>;

    /// Start a row-at-a-time query.
    ///
    /// The cursor owns the connection until it is closed, exhausted or
    /// dropped; nothing is fetched before the first
    /// [`fetch_next`](RowCursor::fetch_next).
    fn stream(self, sql: &str, params: Vec<Value>) -> Self::Cursor;

    /// Return a healthy connection to the pool.
    fn release(self);

    /// Invalidate the connection and discard it from the pool.
    async fn destroy(self) -> Result<(), DriverError>;
}

/// Pull-one row source behind a streaming query.
#[async_trait]
pub trait RowCursor: Send {
    /// Fetch exactly one row; `None` marks the end of the result set.
    ///
    /// Nothing is fetched while no call is outstanding.
    async fn fetch_next(&mut self) -> Result<Option<Row>, DriverError>;

    /// Stop the query and return the borrowed connection to the pool.
    async fn close(self) -> Result<(), DriverError>;
}
