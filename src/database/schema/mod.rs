//! Schema and migration management
//!
//! - `definitions`: the declarative catalog (tables, indexes, views)
//! - `builder`: DDL generation and dependency ordering
//! - `SchemaManager`: create, drop, introspect and validate the live schema
//! - `MigrationManager`: versioned migrations recorded in the ledger

pub mod builder;
pub mod definitions;
mod manager;
mod migration;

pub use definitions::{
    ledger_table, IndexDefinition, SchemaCatalog, TableDefinition, ViewDefinition, LEDGER_TABLE,
    PORTFOLIO_SCHEMA_VERSION,
};
pub use manager::{ColumnMismatch, SchemaInfo, SchemaManager, SchemaValidation, ValidationStatus};
pub use migration::{
    compare_versions, compute_checksum, Migration, MigrationLedgerEntry, MigrationManager,
    MigrationSummary, MigrationType,
};
