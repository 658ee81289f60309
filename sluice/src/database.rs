use futures::future::BoxFuture;
use tracing::instrument;

use crate::{
    config::DbConfig,
    conn::{Connection, PgConnPool, Pool},
    error::{DriverError, Error},
    row::Row,
    stream::QueryStream,
    transaction::{self, TxError, TxHandle, WorkResult},
    types::Value,
};

/// Convenience alias for the production backend.
pub type PgDatabase = Database<PgConnPool>;

/// Transactional execution and streaming queries over an explicitly-passed
/// connection pool.
///
/// Every operation borrows exactly one connection and returns it to the
/// pool (released when healthy, destroyed when poisoned) before the
/// operation completes.
#[derive(Debug, Clone)]
pub struct Database<P: Pool> {
    pool: P,
}

impl<P: Pool> Database<P> {
    pub fn new(pool: P) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    async fn acquire(&self) -> Result<P::Conn, Error> {
        self.pool.acquire().await.map_err(Error::Acquire)
    }

    /// Execute a single statement outside any transaction, returning the
    /// number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        let mut conn = self.acquire().await?;
        let result = conn.execute(sql, params).await;
        conn.release();
        result.map_err(Error::Driver)
    }

    /// Run a query and materialize every row.
    pub async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        let mut conn = self.acquire().await?;
        let result = conn.fetch_all(sql, params).await;
        conn.release();
        result.map_err(Error::Driver)
    }

    /// Run a query expecting zero or one row.
    pub async fn fetch_optional(&self, sql: &str, params: &[Value]) -> Result<Option<Row>, Error> {
        Ok(self.fetch_all(sql, params).await?.into_iter().next())
    }

    /// Run a query expecting exactly one row.
    pub async fn fetch_one(&self, sql: &str, params: &[Value]) -> Result<Row, Error> {
        self.fetch_optional(sql, params)
            .await?
            .ok_or_else(|| Error::Driver(DriverError::new("query returned no rows")))
    }

    /// Run `work` inside a transaction; the outcome is returned from the
    /// future.
    ///
    /// The closure receives a [`TxHandle`] bound to the borrowed
    /// connection. On failure the returned [`TxError`] wraps the primary
    /// cause with a snapshot of how far the transaction progressed. Calling
    /// the runner again from inside `work` is unsupported; there are no
    /// nested transactions.
    pub async fn run_transaction_async<W>(&self, work: W) -> Result<(), TxError>
    where
        W: for<'t> FnOnce(&'t mut TxHandle<P::Conn>) -> BoxFuture<'t, WorkResult> + Send,
    {
        transaction::run(&self.pool, work).await
    }

    /// Run `work` inside a transaction; the outcome is delivered to
    /// `callback`.
    pub async fn run_transaction<W, C>(&self, work: W, callback: C)
    where
        W: for<'t> FnOnce(&'t mut TxHandle<P::Conn>) -> BoxFuture<'t, WorkResult> + Send,
        C: FnOnce(Result<(), TxError>) + Send,
    {
        callback(transaction::run(&self.pool, work).await);
    }

    /// Start a streaming query.
    ///
    /// Borrows one connection for the duration of the query and runs it
    /// row-at-a-time; nothing is fetched until the first
    /// [`try_next`](QueryStream::try_next). The connection goes back to the
    /// pool when the stream ends, errors, is cancelled or is dropped.
    pub async fn query_stream(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<QueryStream<<P::Conn as Connection>::Cursor>, Error> {
        let conn = self.acquire().await?;
        Ok(QueryStream::new(conn.stream(sql, params)))
    }
}

impl Database<PgConnPool> {
    /// Connect to PostgreSQL with the default pool settings from
    /// [`DbConfig::default`].
    #[instrument(skip_all, err)]
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let config = DbConfig::default();
        let pool = PgConnPool::connect(url, config.max_connections, config.acquire_timeout())
            .await
            .map_err(Error::Driver)?;
        Ok(Self::new(pool))
    }

    /// Connect to PostgreSQL with explicit configuration.
    #[instrument(skip_all, err)]
    pub async fn connect_with(config: &DbConfig) -> Result<Self, Error> {
        let pool = PgConnPool::connect(
            &config.url(),
            config.max_connections,
            config.acquire_timeout(),
        )
        .await
        .map_err(Error::Driver)?;
        Ok(Self::new(pool))
    }
}
