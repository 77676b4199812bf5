//! Core database infrastructure
//!
//! This module provides the foundational components every other part of the
//! data-access layer builds on:
//! - `ConnectionManager`: owns the SQLite connection, its lifecycle and tuning
//! - `TransactionManager`: transaction scopes with savepoint-emulated nesting
//! - `QueryExecutor`: validated parameter binding and typed results
//! - `Param` / `Value`: conversion across the engine boundary

mod connection;
mod query;
mod transaction;
mod value;

pub use connection::{
    ConnectionInfo, ConnectionKind, ConnectionManager, ConnectionStatus, StorageTarget,
};
pub use query::{QueryExecutor, QueryResult, Row, StatementOutcome};
pub use transaction::{TransactionManager, TransactionState};
pub use value::{is_valid_identifier, quote_identifier, validate_identifier, Param, Params, Value};
