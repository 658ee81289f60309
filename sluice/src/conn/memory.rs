//! Deterministic in-memory backend.
//!
//! Backs tests and examples without a server: a shared table map with
//! snapshot-based transaction semantics, scripted fault injection and
//! operation counters. Single-writer semantics only: transactions snapshot
//! the whole store, so concurrent writers are not isolated the way a real
//! server isolates them.

use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering::SeqCst},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    vec::IntoIter,
};

use async_trait::async_trait;

use crate::{
    conn::{Connection, Pool, RowCursor},
    error::DriverError,
    row::Row,
    types::Value,
};

const SYNTAX_ERROR: &str = "42601";
const UNDEFINED_COLUMN: &str = "42703";
const UNDEFINED_TABLE: &str = "42P01";

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

type Tables = HashMap<String, Table>;

#[derive(Debug, Default)]
struct Counters {
    acquires: AtomicU32,
    begin_calls: AtomicU32,
    commit_calls: AtomicU32,
    rollback_calls: AtomicU32,
    releases: AtomicU32,
    destroys: AtomicU32,
    row_fetches: AtomicU32,
    cursor_closes: AtomicU32,
    active: AtomicU32,
}

/// Snapshot of the backend's operation counters.
///
/// `begin_calls`/`commit_calls`/`rollback_calls` count attempts, including
/// ones scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCounts {
    pub acquires: u32,
    pub begin_calls: u32,
    pub commit_calls: u32,
    pub rollback_calls: u32,
    pub releases: u32,
    pub destroys: u32,
    pub row_fetches: u32,
    pub cursor_closes: u32,
    pub active: u32,
}

/// Failures to inject, each consumed by the first matching operation.
#[derive(Debug, Default, Clone, Copy)]
struct FaultPlan {
    acquire: bool,
    begin: bool,
    commit: bool,
    rollback: bool,
    destroy: bool,
    fetch_after: Option<u32>,
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    counters: Counters,
    faults: Mutex<FaultPlan>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn take_fault(&self, pick: impl FnOnce(&mut FaultPlan) -> &mut bool) -> bool {
        std::mem::take(pick(&mut *lock(&self.faults)))
    }

    fn take_fetch_fault(&self, fetched: u32) -> bool {
        let mut faults = lock(&self.faults);
        if faults.fetch_after == Some(fetched) {
            faults.fetch_after = None;
            true
        } else {
            false
        }
    }
}

/// In-memory connection pool. Clones share the same store and counters.
#[derive(Debug, Default, Clone)]
pub struct MemoryPool {
    shared: Arc<Shared>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `acquire` with a pool-exhausted error.
    pub fn fail_next_acquire(&self) {
        lock(&self.shared.faults).acquire = true;
    }

    pub fn fail_next_begin(&self) {
        lock(&self.shared.faults).begin = true;
    }

    pub fn fail_next_commit(&self) {
        lock(&self.shared.faults).commit = true;
    }

    pub fn fail_next_rollback(&self) {
        lock(&self.shared.faults).rollback = true;
    }

    pub fn fail_next_destroy(&self) {
        lock(&self.shared.faults).destroy = true;
    }

    /// Fail the fetch that would follow `rows` successful row deliveries on
    /// the next cursor.
    pub fn fail_fetch_after(&self, rows: u32) {
        lock(&self.shared.faults).fetch_after = Some(rows);
    }

    pub fn counts(&self) -> OpCounts {
        let counters = &self.shared.counters;
        OpCounts {
            acquires: counters.acquires.load(SeqCst),
            begin_calls: counters.begin_calls.load(SeqCst),
            commit_calls: counters.commit_calls.load(SeqCst),
            rollback_calls: counters.rollback_calls.load(SeqCst),
            releases: counters.releases.load(SeqCst),
            destroys: counters.destroys.load(SeqCst),
            row_fetches: counters.row_fetches.load(SeqCst),
            cursor_closes: counters.cursor_closes.load(SeqCst),
            active: counters.active.load(SeqCst),
        }
    }
}

#[async_trait]
impl Pool for MemoryPool {
    type Conn = MemoryConnection;

    async fn acquire(&self) -> Result<MemoryConnection, DriverError> {
        if self.shared.take_fault(|faults| &mut faults.acquire) {
            return Err(DriverError::with_code(
                "connection pool exhausted",
                "53300",
            ));
        }
        self.shared.counters.acquires.fetch_add(1, SeqCst);
        self.shared.counters.active.fetch_add(1, SeqCst);
        Ok(MemoryConnection {
            shared: Arc::clone(&self.shared),
            snapshot: None,
            open: true,
        })
    }

    fn active(&self) -> u32 {
        self.shared.counters.active.load(SeqCst)
    }
}

/// A borrowed in-memory connection.
#[derive(Debug)]
pub struct MemoryConnection {
    shared: Arc<Shared>,
    snapshot: Option<Tables>,
    open: bool,
}

impl MemoryConnection {
    fn finish(&mut self, destroyed: bool) {
        if !self.open {
            return;
        }
        self.open = false;
        self.shared.counters.active.fetch_sub(1, SeqCst);
        if destroyed {
            self.shared.counters.destroys.fetch_add(1, SeqCst);
        } else {
            self.shared.counters.releases.fetch_add(1, SeqCst);
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.finish(false);
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Cursor = MemoryCursor;

    async fn begin(&mut self) -> Result<(), DriverError> {
        self.shared.counters.begin_calls.fetch_add(1, SeqCst);
        if self.shared.take_fault(|faults| &mut faults.begin) {
            return Err(DriverError::with_code(
                "could not begin transaction",
                "25000",
            ));
        }
        self.snapshot = Some(lock(&self.shared.tables).clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.shared.counters.commit_calls.fetch_add(1, SeqCst);
        if self.shared.take_fault(|faults| &mut faults.commit) {
            return Err(DriverError::with_code(
                "could not commit transaction",
                "40001",
            ));
        }
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.shared.counters.rollback_calls.fetch_add(1, SeqCst);
        if self.shared.take_fault(|faults| &mut faults.rollback) {
            return Err(DriverError::with_code(
                "could not roll back transaction",
                "25P02",
            ));
        }
        if let Some(snapshot) = self.snapshot.take() {
            *lock(&self.shared.tables) = snapshot;
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DriverError> {
        let statement = parse(sql)?;
        let mut tables = lock(&self.shared.tables);
        match run_statement(&mut tables, &statement, params)? {
            Outcome::Affected(count) => Ok(count),
            Outcome::Rows(rows) => Ok(rows.len() as u64),
        }
    }

    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DriverError> {
        let statement = parse(sql)?;
        let mut tables = lock(&self.shared.tables);
        match run_statement(&mut tables, &statement, params)? {
            Outcome::Affected(_) => Ok(Vec::new()),
            Outcome::Rows(rows) => Ok(rows),
        }
    }

    fn stream(self, sql: &str, params: Vec<Value>) -> MemoryCursor {
        let shared = Arc::clone(&self.shared);
        MemoryCursor {
            shared,
            conn: Some(self),
            sql: sql.to_string(),
            params,
            rows: None,
            fetched: 0,
        }
    }

    fn release(mut self) {
        self.finish(false);
    }

    async fn destroy(mut self) -> Result<(), DriverError> {
        let fault = self.shared.take_fault(|faults| &mut faults.destroy);
        self.finish(true);
        if fault {
            return Err(DriverError::new("failed to terminate backend session"));
        }
        Ok(())
    }
}

/// Pull-one cursor over the in-memory store.
///
/// The query runs on the first fetch; each delivered row bumps the
/// `row_fetches` counter, so tests can assert that nothing is fetched while
/// the consumer is idle.
#[derive(Debug)]
pub struct MemoryCursor {
    shared: Arc<Shared>,
    conn: Option<MemoryConnection>,
    sql: String,
    params: Vec<Value>,
    rows: Option<IntoIter<Row>>,
    fetched: u32,
}

impl MemoryCursor {
    fn finish(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.counters.cursor_closes.fetch_add(1, SeqCst);
            drop(conn);
        }
    }
}

impl Drop for MemoryCursor {
    fn drop(&mut self) {
        self.finish();
    }
}

#[async_trait]
impl RowCursor for MemoryCursor {
    async fn fetch_next(&mut self) -> Result<Option<Row>, DriverError> {
        if self.conn.is_none() {
            return Ok(None);
        }

        if self.rows.is_none() {
            let statement = parse(&self.sql);
            let outcome = statement.and_then(|statement| {
                let mut tables = lock(&self.shared.tables);
                run_statement(&mut tables, &statement, &self.params)
            });
            match outcome {
                Ok(Outcome::Rows(rows)) => self.rows = Some(rows.into_iter()),
                Ok(Outcome::Affected(_)) => self.rows = Some(Vec::new().into_iter()),
                Err(error) => {
                    self.finish();
                    return Err(error);
                }
            }
        }

        if self.shared.take_fetch_fault(self.fetched) {
            self.finish();
            return Err(DriverError::with_code(
                "backend terminated the query",
                "57014",
            ));
        }

        match self.rows.as_mut().and_then(Iterator::next) {
            Some(row) => {
                self.fetched += 1;
                self.shared.counters.row_fetches.fetch_add(1, SeqCst);
                Ok(Some(row))
            }
            None => {
                self.finish();
                Ok(None)
            }
        }
    }

    async fn close(mut self) -> Result<(), DriverError> {
        self.finish();
        Ok(())
    }
}

enum Outcome {
    Affected(u64),
    Rows(Vec<Row>),
}

#[derive(Debug, PartialEq)]
enum Statement {
    Create {
        table: String,
        columns: Vec<String>,
    },
    Insert {
        table: String,
        columns: Vec<String>,
    },
    Select {
        table: String,
        /// Empty means `*`.
        projection: Vec<String>,
        order_by: Option<(String, bool)>,
    },
    Delete {
        table: String,
    },
}

fn syntax_error(sql: &str) -> DriverError {
    DriverError::with_code(format!("syntax error at or near {:?}", sql), SYNTAX_ERROR)
}

fn undefined_table(table: &str) -> DriverError {
    DriverError::with_code(
        format!("relation {:?} does not exist", table),
        UNDEFINED_TABLE,
    )
}

fn undefined_column(column: &str) -> DriverError {
    DriverError::with_code(
        format!("column {:?} does not exist", column),
        UNDEFINED_COLUMN,
    )
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        match ch {
            '(' | ')' | ',' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(ch.to_string());
            }
            ch if ch.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            ch => current.push(ch),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn ident(tokens: &[String], index: usize, sql: &str) -> Result<String, DriverError> {
    tokens
        .get(index)
        .filter(|token| !matches!(token.as_str(), "(" | ")" | ","))
        .cloned()
        .ok_or_else(|| syntax_error(sql))
}

/// Recognizes the statement shapes the backend supports. Anything else is a
/// syntax error carrying SQLSTATE 42601, the same way a real driver would
/// report it.
fn parse(sql: &str) -> Result<Statement, DriverError> {
    let tokens = tokenize(sql.trim().trim_end_matches(';'));
    let kw = |index: usize, word: &str| {
        tokens
            .get(index)
            .is_some_and(|token| token.eq_ignore_ascii_case(word))
    };

    if kw(0, "CREATE") && kw(1, "TABLE") {
        let mut index = 2;
        if kw(2, "IF") && kw(3, "NOT") && kw(4, "EXISTS") {
            index = 5;
        }
        let table = ident(&tokens, index, sql)?;

        let mut columns = Vec::new();
        let mut depth = 0u32;
        let mut expect_name = false;
        for token in &tokens[index + 1..] {
            match token.as_str() {
                "(" => {
                    depth += 1;
                    if depth == 1 {
                        expect_name = true;
                    }
                }
                ")" => depth = depth.saturating_sub(1),
                "," => {
                    if depth == 1 {
                        expect_name = true;
                    }
                }
                name => {
                    if depth == 1 && expect_name {
                        columns.push(name.to_string());
                        expect_name = false;
                    }
                }
            }
        }
        if columns.is_empty() {
            return Err(syntax_error(sql));
        }
        Ok(Statement::Create { table, columns })
    } else if kw(0, "INSERT") && kw(1, "INTO") {
        let table = ident(&tokens, 2, sql)?;
        if !kw(3, "(") {
            return Err(syntax_error(sql));
        }
        let mut columns = Vec::new();
        let mut index = 4;
        while index < tokens.len() && !kw(index, ")") {
            if !kw(index, ",") {
                columns.push(tokens[index].clone());
            }
            index += 1;
        }
        let has_values = tokens[index..]
            .iter()
            .any(|token| token.eq_ignore_ascii_case("VALUES"));
        if columns.is_empty() || !has_values {
            return Err(syntax_error(sql));
        }
        Ok(Statement::Insert { table, columns })
    } else if kw(0, "SELECT") {
        let mut projection = Vec::new();
        let mut index = 1;
        while index < tokens.len() && !kw(index, "FROM") {
            let token = &tokens[index];
            if token != "*" && token != "," {
                projection.push(token.clone());
            }
            index += 1;
        }
        if !kw(index, "FROM") {
            return Err(syntax_error(sql));
        }
        let table = ident(&tokens, index + 1, sql)?;
        index += 2;

        let mut order_by = None;
        if index < tokens.len() {
            if !(kw(index, "ORDER") && kw(index + 1, "BY")) {
                return Err(syntax_error(sql));
            }
            let column = ident(&tokens, index + 2, sql)?;
            let mut ascending = true;
            index += 3;
            if kw(index, "DESC") {
                ascending = false;
                index += 1;
            } else if kw(index, "ASC") {
                index += 1;
            }
            if index != tokens.len() {
                return Err(syntax_error(sql));
            }
            order_by = Some((column, ascending));
        }
        Ok(Statement::Select {
            table,
            projection,
            order_by,
        })
    } else if kw(0, "DELETE") && kw(1, "FROM") {
        let table = ident(&tokens, 2, sql)?;
        if tokens.len() > 3 {
            return Err(syntax_error(sql));
        }
        Ok(Statement::Delete { table })
    } else {
        Err(syntax_error(sql))
    }
}

fn column_index(table: &Table, column: &str) -> Result<usize, DriverError> {
    table
        .columns
        .iter()
        .position(|name| name == column)
        .ok_or_else(|| undefined_column(column))
}

fn cmp_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
        (Value::Text(a), Value::Text(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Null, Value::Null) => Ordering::Equal,
        // NULLS LAST
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

fn run_statement(
    tables: &mut Tables,
    statement: &Statement,
    params: &[Value],
) -> Result<Outcome, DriverError> {
    match statement {
        Statement::Create { table, columns } => {
            tables.entry(table.clone()).or_insert_with(|| Table {
                columns: columns.clone(),
                rows: Vec::new(),
            });
            Ok(Outcome::Affected(0))
        }
        Statement::Insert { table, columns } => {
            let table = tables.get_mut(table).ok_or_else(|| undefined_table(table))?;
            if params.len() != columns.len() {
                return Err(DriverError::with_code(
                    format!(
                        "expected {} parameters, got {}",
                        columns.len(),
                        params.len()
                    ),
                    SYNTAX_ERROR,
                ));
            }
            let mut row = vec![Value::Null; table.columns.len()];
            for (column, value) in columns.iter().zip(params) {
                let index = column_index(table, column)?;
                row[index] = value.clone();
            }
            table.rows.push(row);
            Ok(Outcome::Affected(1))
        }
        Statement::Select {
            table,
            projection,
            order_by,
        } => {
            let table = tables.get(table).ok_or_else(|| undefined_table(table))?;
            let mut rows = table.rows.clone();

            if let Some((column, ascending)) = order_by {
                let index = column_index(table, column)?;
                rows.sort_by(|a, b| {
                    let ordering = cmp_values(&a[index], &b[index]);
                    if *ascending {
                        ordering
                    } else {
                        ordering.reverse()
                    }
                });
            }

            let (header, rows) = if projection.is_empty() {
                (table.columns.clone(), rows)
            } else {
                let indices = projection
                    .iter()
                    .map(|column| column_index(table, column))
                    .collect::<Result<Vec<_>, _>>()?;
                let rows = rows
                    .into_iter()
                    .map(|row| indices.iter().map(|&index| row[index].clone()).collect())
                    .collect();
                (projection.clone(), rows)
            };

            let header: Arc<[String]> = header.into();
            Ok(Outcome::Rows(
                rows.into_iter()
                    .map(|values| Row::new(Arc::clone(&header), values))
                    .collect(),
            ))
        }
        Statement::Delete { table } => {
            let table = tables.get_mut(table).ok_or_else(|| undefined_table(table))?;
            let count = table.rows.len() as u64;
            table.rows.clear();
            Ok(Outcome::Affected(count))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{Connection, Pool};

    #[test]
    fn parses_the_supported_statement_shapes() {
        assert_eq!(
            parse("CREATE TABLE IF NOT EXISTS people (name VARCHAR(255) DEFAULT NULL, age INT)")
                .expect("create"),
            Statement::Create {
                table: "people".to_string(),
                columns: vec!["name".to_string(), "age".to_string()],
            }
        );
        assert_eq!(
            parse("INSERT INTO people (name, age) VALUES ($1, $2)").expect("insert"),
            Statement::Insert {
                table: "people".to_string(),
                columns: vec!["name".to_string(), "age".to_string()],
            }
        );
        assert_eq!(
            parse("SELECT * FROM people ORDER BY name ASC").expect("select"),
            Statement::Select {
                table: "people".to_string(),
                projection: Vec::new(),
                order_by: Some(("name".to_string(), true)),
            }
        );
        assert_eq!(
            parse("DELETE FROM people;").expect("delete"),
            Statement::Delete {
                table: "people".to_string(),
            }
        );
    }

    #[test]
    fn unsupported_sql_reports_a_syntax_error_code() {
        let error = parse("UPDATE people SET age = 1").unwrap_err();
        assert_eq!(error.code(), Some(SYNTAX_ERROR));

        let error = parse("SELECT * FROM people WHERE age > 1").unwrap_err();
        assert_eq!(error.code(), Some(SYNTAX_ERROR));
    }

    #[tokio::test]
    async fn rollback_restores_the_snapshot() {
        let pool = MemoryPool::new();
        let mut conn = pool.acquire().await.expect("acquire");
        conn.execute("CREATE TABLE people (name, age)", &[])
            .await
            .expect("create");

        conn.begin().await.expect("begin");
        conn.execute(
            "INSERT INTO people (name, age) VALUES ($1, $2)",
            &[Value::from("john doe"), Value::from(27)],
        )
        .await
        .expect("insert");
        conn.rollback().await.expect("rollback");

        let rows = conn
            .fetch_all("SELECT * FROM people", &[])
            .await
            .expect("select");
        assert!(rows.is_empty());
        conn.release();

        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn missing_table_reports_undefined_table() {
        let pool = MemoryPool::new();
        let mut conn = pool.acquire().await.expect("acquire");
        let error = conn
            .fetch_all("SELECT * FROM nowhere", &[])
            .await
            .unwrap_err();
        assert_eq!(error.code(), Some(UNDEFINED_TABLE));
    }
}
