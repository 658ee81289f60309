//! PostgreSQL backend over sqlx.

use std::{sync::Arc, time::Duration};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::{BoxStream, TryStreamExt};
use sqlx::{
    pool::PoolConnection,
    postgres::{PgArguments, PgPoolOptions, PgRow},
    query::Query,
    Column as _, Postgres, Row as _, TypeInfo as _,
};
use tracing::instrument;

use crate::{
    conn::{Connection, Pool, RowCursor},
    error::DriverError,
    row::Row,
    types::Value,
};

/// Connection pool to a PostgreSQL database. Clones refer to the same pool.
#[derive(Debug, Clone)]
pub struct PgConnPool(sqlx::Pool<Postgres>);

impl PgConnPool {
    /// Set up a connection pool.
    #[instrument(skip_all, err)]
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, DriverError> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map(Self)
            .map_err(DriverError::from)
    }

    pub fn inner(&self) -> &sqlx::Pool<Postgres> {
        &self.0
    }
}

#[async_trait]
impl Pool for PgConnPool {
    type Conn = PgConn;

    async fn acquire(&self) -> Result<PgConn, DriverError> {
        let conn = self.0.acquire().await?;
        Ok(PgConn { conn })
    }

    fn active(&self) -> u32 {
        self.0.size() - self.0.num_idle() as u32
    }
}

/// An exclusively-borrowed pooled connection.
#[derive(Debug)]
pub struct PgConn {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl Connection for PgConn {
    type Cursor = PgRowCursor;

    async fn begin(&mut self) -> Result<(), DriverError> {
        sqlx::query("BEGIN").execute(&mut *self.conn).await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DriverError> {
        let query = bind_all(sqlx::query(sql), params);
        let result = query.execute(&mut *self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DriverError> {
        let query = bind_all(sqlx::query(sql), params);
        let rows = query.fetch_all(&mut *self.conn).await?;
        let mut header = None;
        rows.iter().map(|row| decode_row(row, &mut header)).collect()
    }

    fn stream(self, sql: &str, params: Vec<Value>) -> PgRowCursor {
        PgRowCursor::new(self.conn, sql.to_string(), params)
    }

    fn release(self) {
        // Dropping a pooled connection hands it back to the pool.
        drop(self.conn);
    }

    async fn destroy(self) -> Result<(), DriverError> {
        // Detach so the pool never sees this handle again, then terminate
        // the session.
        sqlx::Connection::close(self.conn.detach()).await?;
        Ok(())
    }
}

/// Row-at-a-time cursor over a pooled connection.
///
/// The generator owns the connection for the duration of the query: it goes
/// back to the pool when the cursor is exhausted, closed or dropped. Rows
/// are only pulled while a `fetch_next` call is outstanding.
pub struct PgRowCursor {
    rows: BoxStream<'static, Result<Row, DriverError>>,
}

impl PgRowCursor {
    fn new(conn: PoolConnection<Postgres>, sql: String, params: Vec<Value>) -> Self {
        let rows = try_stream! {
            let mut conn = conn;
            let query = bind_all(sqlx::query(&sql), &params);
            let mut rows = query.fetch(&mut *conn);
            let mut header = None;
            while let Some(row) = rows.try_next().await.map_err(DriverError::from)? {
                yield decode_row(&row, &mut header)?;
            }
        };
        Self {
            rows: Box::pin(rows),
        }
    }
}

#[async_trait]
impl RowCursor for PgRowCursor {
    async fn fetch_next(&mut self) -> Result<Option<Row>, DriverError> {
        self.rows.try_next().await
    }

    async fn close(self) -> Result<(), DriverError> {
        // Dropping the generator drops the driver stream and the pooled
        // connection, which returns it to the pool.
        drop(self.rows);
        Ok(())
    }
}

fn bind_all<'q>(
    query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    params.iter().fold(query, |query, value| match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(value) => query.bind(*value),
        Value::Int(value) => query.bind(*value),
        Value::Float(value) => query.bind(*value),
        Value::Text(value) => query.bind(value.as_str()),
        Value::Bytes(value) => query.bind(value.as_slice()),
    })
}

fn decode_row(row: &PgRow, header: &mut Option<Arc<[String]>>) -> Result<Row, DriverError> {
    let columns = match header {
        Some(columns) => Arc::clone(columns),
        None => {
            let columns: Arc<[String]> = row
                .columns()
                .iter()
                .map(|column| column.name().to_string())
                .collect();
            *header = Some(Arc::clone(&columns));
            columns
        }
    };

    let mut values = Vec::with_capacity(columns.len());
    for index in 0..columns.len() {
        values.push(decode_value(row, index)?);
    }
    Ok(Row::new(columns, values))
}

fn decode_value(row: &PgRow, index: usize) -> Result<Value, DriverError> {
    let column = &row.columns()[index];
    let value = match column.type_info().name() {
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(Value::Bool),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)?
            .map(|value| Value::Int(value.into())),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)?
            .map(|value| Value::Int(value.into())),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(Value::Int),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)?
            .map(|value| Value::Float(value.into())),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.map(Value::Float),
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" => row
            .try_get::<Option<String>, _>(index)?
            .map(Value::Text),
        "BYTEA" => row.try_get::<Option<Vec<u8>>, _>(index)?.map(Value::Bytes),
        other => {
            return Err(DriverError::new(format!(
                "unsupported column type {} for column {}",
                other,
                column.name()
            )))
        }
    };
    Ok(value.unwrap_or(Value::Null))
}
