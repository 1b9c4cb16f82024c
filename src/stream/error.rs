use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type for stream consumer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type handlers return; any error converts into it with `?`
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error types for the consumption pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Structurally invalid bytes - truncated datum, bad magic byte, undecodable key
    #[error("Corrupt encoding: {0}")]
    CorruptEncoding(String),

    /// Writer schema cannot be read with the reader schema, or the schema id is unknown
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The registered handler returned an error or timed out
    #[error("Handler error: {0}")]
    Handler(String),

    /// Offset commit did not succeed within the retry budget
    #[error("Commit failed after {attempts} attempt(s): {reason}")]
    CommitFailure { attempts: u32, reason: String },

    /// The coordinator no longer considers this member the owner
    #[error("Assignment lost: {0}")]
    AssignmentLost(String),

    /// Schema registry unreachable or returned something unusable
    #[error("Schema registry error: {0}")]
    SchemaRegistry(String),

    /// Broker client failure (fetch, seek, group membership)
    #[error("Broker error: {0}")]
    Broker(String),

    /// Validation error - invalid configuration or API misuse
    #[error("Validation error: {0}")]
    Validation(String),

    /// Connection error - offset store unreachable or authentication failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Database error - SQL errors, constraint violations
    #[error("Database error: {0}")]
    Database(String),

    /// Pool error - connection pool issues
    #[error("Pool error: {0}")]
    Pool(String),
}

/// Classification of errors reported to an error sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CorruptEncoding,
    SchemaMismatch,
    HandlerError,
    CommitFailure,
    AssignmentLost,
    SchemaRegistry,
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CorruptEncoding => "corrupt_encoding",
            ErrorKind::SchemaMismatch => "schema_mismatch",
            ErrorKind::HandlerError => "handler_error",
            ErrorKind::CommitFailure => "commit_failure",
            ErrorKind::AssignmentLost => "assignment_lost",
            ErrorKind::SchemaRegistry => "schema_registry",
            ErrorKind::Infrastructure => "infrastructure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Map this error onto the reporting taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CorruptEncoding(_) => ErrorKind::CorruptEncoding,
            Error::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            Error::Handler(_) => ErrorKind::HandlerError,
            Error::CommitFailure { .. } => ErrorKind::CommitFailure,
            Error::AssignmentLost(_) => ErrorKind::AssignmentLost,
            Error::SchemaRegistry(_) => ErrorKind::SchemaRegistry,
            Error::Broker(_)
            | Error::Validation(_)
            | Error::Connection(_)
            | Error::Database(_)
            | Error::Pool(_) => ErrorKind::Infrastructure,
        }
    }

    /// Records that fail with this error can never be processed and must not stall the partition
    pub fn is_poison_pill(&self) -> bool {
        matches!(self, Error::CorruptEncoding(_) | Error::SchemaMismatch(_))
    }

    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Broker(_)
                | Error::Connection(_)
                | Error::Database(_)
                | Error::Pool(_)
                | Error::CommitFailure { .. }
                | Error::SchemaRegistry(_)
        )
    }

    pub(crate) fn handler(err: BoxError) -> Self {
        Error::Handler(err.to_string())
    }
}

/// Convert tokio-postgres errors to stream errors
impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_error) = err.as_db_error() {
            return Error::Database(format!("{}: {}", db_error.code().code(), db_error.message()));
        }

        Error::Database(format!("{:?}", err))
    }
}

/// Convert deadpool errors to stream errors
impl From<deadpool_postgres::PoolError> for Error {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Error::Pool(err.to_string())
    }
}

/// Convert deadpool build errors to stream errors
impl From<deadpool_postgres::BuildError> for Error {
    fn from(err: deadpool_postgres::BuildError) -> Self {
        Error::Connection(err.to_string())
    }
}

/// Avro schema or datum errors outside the decode path
impl From<apache_avro::Error> for Error {
    fn from(err: apache_avro::Error) -> Self {
        Error::SchemaMismatch(err.to_string())
    }
}

/// Registry transport failures
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Error::SchemaRegistry(format!("HTTP {}: {}", status.as_u16(), err)),
            None => Error::SchemaRegistry(err.to_string()),
        }
    }
}

/// Convert JSON errors to stream errors
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(format!("JSON error: {}", err))
    }
}
