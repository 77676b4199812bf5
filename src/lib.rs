#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Portfolio Store - transactional data access for the portfolio manager
//!
//! Portfolio Store wraps a single embedded SQLite connection and layers on top
//! of it everything the rest of the system needs to read and write portfolio
//! data safely. It can be used as both a command-line application and a
//! library.
//!
//! # Feature Flags
//!
//! | Feature | Description | Key Dependencies |
//! |---------|-------------|------------------|
//! | `display` | Table formatting for query results | `tabled` |
//! | `cli` | The `portfolio-store` binary | All above + `clap`, `tracing-subscriber` |
//!
//! ```toml
//! # Library only
//! portfolio-store = { version = "0.1", default-features = false }
//!
//! # Library with table output
//! portfolio-store = { version = "0.1", default-features = false, features = ["display"] }
//! ```
//!
//! # Architecture
//!
//! - **[`database`]**: the data-access layer
//!   - `core`: connection, transaction and query management
//!   - `schema`: the portfolio catalog, schema lifecycle and migrations
//!   - `error`: the `DbError` taxonomy
//!
//! - **[`config`]**: configuration loaded from TOML and the environment
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use portfolio_store::*;
//!
//! let config = StoreConfig::new(&None)?;
//! let conn = ConnectionManager::open(&config.database_path(), config.settings.clone())?;
//! let transactions = TransactionManager::new(&conn);
//! let executor = QueryExecutor::new(&conn, &transactions);
//!
//! // Bring the schema up, then apply pending migrations from a directory
//! SchemaManager::new(&executor).create_schema()?;
//! let migrations = MigrationManager::with_migrations(
//!     &executor,
//!     MigrationManager::load_migrations_from_directory("migrations")?,
//! );
//! migrations.migrate_to_version(None)?;
//!
//! // Typed results: REAL columns come back as decimals, timestamps as UTC
//! let result = executor.execute_query(
//!     "SELECT symbol, close, timestamp FROM asset_snapshots WHERE symbol = ?",
//!     &Params::positional(["AAPL"]),
//! )?;
//! for row in result.rows() {
//!     println!("{:?} {:?}", row.get("close"), row.get("timestamp"));
//! }
//! ```

pub mod config;
pub mod database;

// =============================================================================
// Configuration
// =============================================================================

pub use config::{ConnectionSettings, PragmaValue, StoreConfig};

// =============================================================================
// Database Module - Re-export commonly used types
// =============================================================================

pub use database::{
    ConnectionInfo, ConnectionManager, ConnectionStatus, DbError, FailureKind, Param, Params,
    QueryExecutor, QueryResult, Row, TransactionManager, Value,
};

pub use database::{
    Migration, MigrationLedgerEntry, MigrationManager, MigrationType, SchemaCatalog, SchemaInfo,
    SchemaManager, SchemaValidation,
};
