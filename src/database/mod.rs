//! Database module
//!
//! The data-access layer for the portfolio store, organized into:
//!
//! - **core**: connection lifecycle, transaction scopes, query execution
//! - **schema**: the portfolio catalog, schema lifecycle and migrations
//! - **error**: the error taxonomy shared by both
//!
//! # Architecture
//!
//! ```text
//! database/
//! ├── core/              # Foundation
//! │   ├── connection     # ConnectionManager: open, tune, probe, close
//! │   ├── transaction    # TransactionManager: depth tracking, savepoints
//! │   ├── query          # QueryExecutor: binding, typed rows, batches
//! │   └── value          # Param / Value conversion, identifier checks
//! │
//! ├── schema/            # Structure
//! │   ├── definitions    # SchemaCatalog for the portfolio tables
//! │   ├── builder        # CREATE / DROP generation, dependency order
//! │   ├── manager        # SchemaManager
//! │   └── migration      # MigrationManager and the schema_migrations ledger
//! │
//! └── error              # DbError, FailureKind
//! ```
//!
//! Components borrow from the one below them, so a single connection is
//! shared by everything built on top of it:
//!
//! ```rust,ignore
//! use portfolio_store::database::*;
//!
//! let conn = ConnectionManager::open_in_memory()?;
//! let transactions = TransactionManager::new(&conn);
//! let executor = QueryExecutor::new(&conn, &transactions);
//!
//! SchemaManager::new(&executor).create_schema()?;
//!
//! transactions.transaction(|| {
//!     executor.execute_command(
//!         "INSERT INTO assets (symbol, exchange, asset_type, name) \
//!          VALUES (:symbol, :exchange, :type, :name)",
//!         &Params::named([
//!             ("symbol", "AAPL"),
//!             ("exchange", "NASDAQ"),
//!             ("type", "STOCK"),
//!             ("name", "Apple Inc."),
//!         ]),
//!     )?;
//!     Ok::<_, DbError>(())
//! })?;
//! ```

pub mod core;
pub mod error;
pub mod schema;

pub use core::{
    is_valid_identifier, quote_identifier, validate_identifier, ConnectionInfo, ConnectionKind,
    ConnectionManager, ConnectionStatus, Param, Params, QueryExecutor, QueryResult, Row,
    StatementOutcome, StorageTarget, TransactionManager, TransactionState, Value,
};
pub use error::{DbError, FailureKind, Result};
pub use schema::{
    compare_versions, ColumnMismatch, IndexDefinition, Migration, MigrationLedgerEntry,
    MigrationManager, MigrationSummary, MigrationType, SchemaCatalog, SchemaInfo, SchemaManager,
    SchemaValidation, TableDefinition, ValidationStatus, ViewDefinition, LEDGER_TABLE,
    PORTFOLIO_SCHEMA_VERSION,
};
