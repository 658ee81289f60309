use thiserror::Error;

use crate::transaction::TxError;

/// Boxed error used for caller-supplied failures and error sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error raised by a connection backend.
///
/// Carries the driver's diagnostic code (a SQLSTATE for the PostgreSQL and
/// in-memory backends) so callers can tell a syntax error from a dropped
/// connection without string matching.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DriverError {
    message: String,
    code: Option<String>,
    #[source]
    source: Option<BoxError>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            source: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
            source: None,
        }
    }

    /// Driver diagnostic code, if the backend reported one.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl From<sqlx::Error> for DriverError {
    fn from(error: sqlx::Error) -> Self {
        let code = match &error {
            sqlx::Error::Database(db_error) => db_error.code().map(|code| code.into_owned()),
            _ => None,
        };
        Self {
            message: error.to_string(),
            code,
            source: Some(Box::new(error)),
        }
    }
}

/// Errors surfaced by the [`Database`](crate::Database) facade.
#[derive(Debug, Error)]
pub enum Error {
    /// The pool could not hand out a connection.
    #[error("error acquiring connection from pool: {0}")]
    Acquire(#[source] DriverError),

    /// A statement or query failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// A transactional run failed; see [`TxError`] for the progress snapshot.
    #[error(transparent)]
    Transaction(#[from] TxError),
}

#[cfg(test)]
mod tests {
    use super::DriverError;

    #[test]
    fn code_is_preserved() {
        let error = DriverError::with_code("syntax error at or near \"SELEC\"", "42601");
        assert_eq!(error.code(), Some("42601"));
        assert_eq!(error.to_string(), "syntax error at or near \"SELEC\"");
    }
}
