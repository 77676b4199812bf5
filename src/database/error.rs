//! Error taxonomy for the data-access layer
//!
//! Every engine failure is classified into a [`FailureKind`] and wrapped into
//! one of the [`DbError`] variants before it leaves this crate. Raw
//! `rusqlite::Error` values never cross the public API.

use rusqlite::ErrorCode;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type used throughout the database layer
pub type Result<T> = std::result::Result<T, DbError>;

/// Classification of an engine failure
///
/// Upstream retry policy keys off this: busy and lost-connection failures are
/// transient, the rest are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Unique, primary key, foreign key, NOT NULL or CHECK violation
    ConstraintViolation,
    /// The statement did not compile (syntax error, unknown table or column)
    Syntax,
    /// The store could not be opened or read (I/O, corruption, not a database)
    ConnectionLost,
    /// The store is locked by another connection
    Busy,
    /// A write was attempted on a read-only store
    ReadOnly,
    /// A value could not be converted between Rust and the engine
    Conversion,
    /// Anything else
    Other,
}

impl FailureKind {
    /// Classify an engine error
    pub fn classify(err: &rusqlite::Error) -> FailureKind {
        match err {
            rusqlite::Error::SqliteFailure(failure, message) => match failure.code {
                ErrorCode::ConstraintViolation => FailureKind::ConstraintViolation,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => FailureKind::Busy,
                ErrorCode::ReadOnly => FailureKind::ReadOnly,
                ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::SystemIoFailure
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::DiskFull
                | ErrorCode::FileLockingProtocolFailed => FailureKind::ConnectionLost,
                ErrorCode::TypeMismatch | ErrorCode::TooBig => FailureKind::Conversion,
                _ => match message {
                    Some(msg) if is_compile_failure(msg) => FailureKind::Syntax,
                    _ => FailureKind::Other,
                },
            },
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::ToSqlConversionFailure(..)
            | rusqlite::Error::Utf8Error(..)
            | rusqlite::Error::NulError(..) => FailureKind::Conversion,
            rusqlite::Error::InvalidPath(..) => FailureKind::ConnectionLost,
            rusqlite::Error::MultipleStatement | rusqlite::Error::InvalidQuery => {
                FailureKind::Syntax
            }
            other if is_compile_failure(&other.to_string()) => FailureKind::Syntax,
            _ => FailureKind::Other,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::Busy | FailureKind::ConnectionLost)
    }
}

fn is_compile_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("syntax error")
        || lower.contains("no such table")
        || lower.contains("no such column")
        || lower.contains("no such function")
        || lower.contains("incomplete input")
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::ConstraintViolation => "constraint violation",
            FailureKind::Syntax => "syntax",
            FailureKind::ConnectionLost => "connection lost",
            FailureKind::Busy => "busy",
            FailureKind::ReadOnly => "read-only",
            FailureKind::Conversion => "conversion",
            FailureKind::Other => "other",
        };
        write!(f, "{}", name)
    }
}

/// Errors raised by the data-access layer
#[derive(Debug, Error)]
pub enum DbError {
    #[error("connection error: {message}")]
    Connection {
        message: String,
        kind: Option<FailureKind>,
    },

    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<DbError>>,
    },

    #[error("query error ({kind}): {message}")]
    Query { message: String, kind: FailureKind },

    #[error("parameter error: {0}")]
    Parameter(String),

    #[error("schema error: {message}")]
    Schema {
        message: String,
        #[source]
        source: Option<Box<DbError>>,
    },

    #[error("migration error: {message}")]
    Migration {
        message: String,
        #[source]
        source: Option<Box<DbError>>,
    },
}

impl DbError {
    pub fn connection(message: impl Into<String>) -> Self {
        DbError::Connection {
            message: message.into(),
            kind: None,
        }
    }

    /// Wrap an engine error raised while acquiring or probing the connection
    pub fn connection_from(context: &str, err: rusqlite::Error) -> Self {
        DbError::Connection {
            message: format!("{}: {}", context, err),
            kind: Some(FailureKind::classify(&err)),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        DbError::Transaction {
            message: message.into(),
            source: None,
        }
    }

    pub fn transaction_caused_by(message: impl Into<String>, source: DbError) -> Self {
        DbError::Transaction {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Wrap an engine error raised by a statement
    pub fn query_from(context: &str, err: rusqlite::Error) -> Self {
        DbError::Query {
            message: format!("{}: {}", context, err),
            kind: FailureKind::classify(&err),
        }
    }

    pub fn query(kind: FailureKind, message: impl Into<String>) -> Self {
        DbError::Query {
            message: message.into(),
            kind,
        }
    }

    pub fn parameter(message: impl Into<String>) -> Self {
        DbError::Parameter(message.into())
    }

    pub fn schema(message: impl Into<String>) -> Self {
        DbError::Schema {
            message: message.into(),
            source: None,
        }
    }

    pub fn schema_caused_by(message: impl Into<String>, source: DbError) -> Self {
        DbError::Schema {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn migration(message: impl Into<String>) -> Self {
        DbError::Migration {
            message: message.into(),
            source: None,
        }
    }

    pub fn migration_caused_by(message: impl Into<String>, source: DbError) -> Self {
        DbError::Migration {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The engine failure classification, following wrapped sources
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            DbError::Connection { kind, .. } => kind.or(Some(FailureKind::ConnectionLost)),
            DbError::Query { kind, .. } => Some(*kind),
            DbError::Parameter(_) => None,
            DbError::Transaction { source, .. }
            | DbError::Schema { source, .. }
            | DbError::Migration { source, .. } => {
                source.as_deref().and_then(DbError::failure_kind)
            }
        }
    }

    /// Whether retrying the same unit of work may succeed
    pub fn is_retryable(&self) -> bool {
        self.failure_kind()
            .map(|kind| kind.is_transient())
            .unwrap_or(false)
    }
}
