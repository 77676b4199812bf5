//! Schema management
//!
//! Brings a catalog up and down, introspects the live schema and keeps the
//! schema version in the migration ledger.

use crate::database::core::{Param, Params, QueryExecutor, Value};
use crate::database::error::{DbError, Result};
use crate::database::schema::builder;
use crate::database::schema::definitions::{
    ledger_table, SchemaCatalog, TableDefinition, LEDGER_TABLE,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Ledger name and type recorded for a schema version row
const SCHEMA_INIT_NAME: &str = "schema_creation";
const SCHEMA_INIT_TYPE: &str = "schema_init";
const SCHEMA_INIT_CHECKSUM: &str = "initial";

/// Columns that differ between the catalog and the live table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnMismatch {
    pub table: String,
    pub missing_columns: Vec<String>,
    pub extra_columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValidationStatus {
    Valid,
    Invalid,
}

/// Comparison of the live schema against the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaValidation {
    pub status: ValidationStatus,
    pub missing_tables: Vec<String>,
    pub extra_tables: Vec<String>,
    pub column_mismatches: Vec<ColumnMismatch>,
    pub integrity_violations: Vec<String>,
    pub schema_version: Option<String>,
}

impl SchemaValidation {
    pub fn is_valid(&self) -> bool {
        self.status == ValidationStatus::Valid
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaInfo {
    pub version: Option<String>,
    pub table_count: usize,
    pub tables: Vec<String>,
    pub schema_exists: bool,
}

/// Schema lifecycle over a query executor
pub struct SchemaManager<'a> {
    executor: &'a QueryExecutor<'a>,
    catalog: SchemaCatalog,
}

impl<'a> SchemaManager<'a> {
    /// Manager for the portfolio catalog
    pub fn new(executor: &'a QueryExecutor<'a>) -> Self {
        Self::with_catalog(executor, SchemaCatalog::portfolio())
    }

    pub fn with_catalog(executor: &'a QueryExecutor<'a>, catalog: SchemaCatalog) -> Self {
        SchemaManager { executor, catalog }
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// Create every table, index and view of the catalog
    ///
    /// Safe to run repeatedly. Tables are created in dependency order inside a
    /// single transaction; index and view failures are logged and skipped.
    pub fn create_schema(&self) -> Result<()> {
        tracing::info!(
            "Creating schema version {} ({} tables)",
            self.catalog.version,
            self.catalog.tables.len()
        );

        let order = builder::creation_order(&self.catalog.tables);
        self.executor
            .transactions()
            .transaction(|| {
                for name in &order {
                    if let Some(table) = self.catalog.table(name) {
                        self.create_table(table)?;
                    }
                }

                for index in &self.catalog.indexes {
                    let created = builder::create_index_sql(index)
                        .and_then(|sql| self.executor.execute_command(&sql, &Params::None));
                    match created {
                        Ok(_) => tracing::debug!("Created index: {}", index.name),
                        Err(e) => tracing::warn!("Failed to create index {}: {}", index.name, e),
                    }
                }

                for view in &self.catalog.views {
                    let created = builder::create_view_sql(view)
                        .and_then(|sql| self.executor.execute_command(&sql, &Params::None));
                    match created {
                        Ok(_) => tracing::debug!("Created view: {}", view.name),
                        Err(e) => tracing::warn!("Failed to create view {}: {}", view.name, e),
                    }
                }
                Ok(())
            })
            .map_err(|e: DbError| {
                tracing::error!("Schema creation failed: {}", e);
                match e {
                    DbError::Schema { .. } => e,
                    other => DbError::schema_caused_by("Cannot create schema", other),
                }
            })?;

        self.apply_analytic_tuning();
        self.set_schema_version(&self.catalog.version)?;
        tracing::info!("Schema version {} created", self.catalog.version);
        Ok(())
    }

    fn apply_analytic_tuning(&self) {
        if self.executor.connection().is_read_only() {
            return;
        }
        for statement in ["PRAGMA optimize", "ANALYZE"] {
            if let Err(e) = self.executor.execute_script(statement) {
                tracing::warn!("Tuning statement '{}' failed: {}", statement, e);
            }
        }
    }

    /// Drop views, indexes and tables of the catalog, then the ledger
    ///
    /// Each drop is attempted even when an earlier one failed.
    pub fn drop_schema(&self) -> Result<()> {
        self.executor
            .connection()
            .connection()
            .map_err(|e| DbError::schema_caused_by("Cannot drop schema", e))?;

        tracing::info!("Dropping schema version {}", self.catalog.version);
        let mut failures = 0;

        for view in self.catalog.views.iter().rev() {
            if let Err(e) = builder::drop_view_sql(&view.name)
                .and_then(|sql| self.executor.execute_command(&sql, &Params::None))
            {
                failures += 1;
                tracing::warn!("Failed to drop view {}: {}", view.name, e);
            }
        }

        for index in &self.catalog.indexes {
            if let Err(e) = builder::drop_index_sql(&index.name)
                .and_then(|sql| self.executor.execute_command(&sql, &Params::None))
            {
                failures += 1;
                tracing::warn!("Failed to drop index {}: {}", index.name, e);
            }
        }

        let mut tables = builder::drop_order(&self.catalog.tables);
        if self.catalog.table(LEDGER_TABLE).is_none() {
            tables.push(LEDGER_TABLE.to_string());
        }
        for table in tables {
            if let Err(e) = self.drop_table(&table) {
                failures += 1;
                tracing::warn!("Failed to drop table {}: {}", table, e);
            }
        }

        if failures > 0 {
            tracing::warn!("Schema dropped with {} failures", failures);
        } else {
            tracing::info!("Schema dropped");
        }
        Ok(())
    }

    /// True only when every catalog table exists
    pub fn schema_exists(&self) -> Result<bool> {
        let existing = self.get_table_names()?;
        Ok(self
            .catalog
            .tables
            .iter()
            .all(|t| existing.contains(&t.name)))
    }

    /// Latest successfully recorded version in the ledger
    pub fn get_schema_version(&self) -> Result<Option<String>> {
        if !self.table_exists(LEDGER_TABLE)? {
            return Ok(None);
        }
        let value = self
            .executor
            .execute_scalar(
                "SELECT version FROM schema_migrations WHERE success = 1 \
                 ORDER BY applied_at DESC, rowid DESC LIMIT 1",
                &Params::None,
            )
            .map_err(|e| DbError::schema_caused_by("Cannot read schema version", e))?;
        Ok(value.and_then(|v| v.to_text()))
    }

    /// Record `version` in the ledger, creating the ledger when needed
    pub fn set_schema_version(&self, version: &str) -> Result<()> {
        self.create_table(&ledger_table())?;
        self.executor
            .execute_command(
                "INSERT INTO schema_migrations \
                 (version, name, migration_type, applied_at, checksum, success) \
                 VALUES (:version, :name, :migration_type, :applied_at, :checksum, 1) \
                 ON CONFLICT (version) DO UPDATE SET applied_at = excluded.applied_at, success = 1",
                &Params::named([
                    ("version", Param::from(version)),
                    ("name", Param::from(SCHEMA_INIT_NAME)),
                    ("migration_type", Param::from(SCHEMA_INIT_TYPE)),
                    ("applied_at", Param::from(Utc::now())),
                    ("checksum", Param::from(SCHEMA_INIT_CHECKSUM)),
                ]),
            )
            .map_err(|e| DbError::schema_caused_by("Cannot set schema version", e))?;
        tracing::debug!("Schema version set to: {}", version);
        Ok(())
    }

    /// Names of all user tables
    pub fn get_table_names(&self) -> Result<BTreeSet<String>> {
        let rows = self
            .executor
            .fetch_all(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                &Params::None,
            )
            .map_err(|e| DbError::schema_caused_by("Cannot list tables", e))?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().and_then(|v| v.to_text()))
            .collect())
    }

    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let count = self
            .executor
            .execute_scalar(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
                &Params::positional([name]),
            )
            .map_err(|e| DbError::schema_caused_by("Cannot check table existence", e))?;
        Ok(count.and_then(|v| v.as_i64()).unwrap_or(0) > 0)
    }

    /// Introspect a live table; `None` when it does not exist
    pub fn get_table_definition(&self, name: &str) -> Result<Option<TableDefinition>> {
        if !self.table_exists(name)? {
            return Ok(None);
        }

        let columns = self
            .executor
            .execute_query(
                "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?) ORDER BY cid",
                &Params::positional([name]),
            )
            .map_err(|e| DbError::schema_caused_by(format!("Cannot inspect table {}", name), e))?;

        let mut definition = TableDefinition::new(name);
        let mut key_columns = Vec::new();
        for row in columns.rows() {
            let column = text_at(row.get("name"));
            let mut type_expr = text_at(row.get("type"));
            if row.get("notnull").and_then(Value::as_i64).unwrap_or(0) == 1 {
                type_expr.push_str(" NOT NULL");
            }
            if let Some(default) = row.get("dflt_value").and_then(Value::to_text) {
                type_expr.push_str(&format!(" DEFAULT {}", default));
            }
            let key_position = row.get("pk").and_then(Value::as_i64).unwrap_or(0);
            if key_position > 0 {
                key_columns.push((key_position, column.clone()));
            }
            definition.columns.push((column, type_expr.trim().to_string()));
        }
        key_columns.sort();
        definition.primary_key = key_columns.into_iter().map(|(_, c)| c).collect();

        let foreign_keys = self
            .executor
            .execute_query(
                "SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?) ORDER BY id, seq",
                &Params::positional([name]),
            )
            .map_err(|e| {
                DbError::schema_caused_by(format!("Cannot inspect foreign keys of {}", name), e)
            })?;
        for row in foreign_keys.rows() {
            let referenced = text_at(row.get("table"));
            let reference = match row.get("to").and_then(Value::to_text) {
                Some(column) => format!("{}.{}", referenced, column),
                None => referenced,
            };
            definition
                .foreign_keys
                .push((text_at(row.get("from")), reference));
        }

        Ok(Some(definition))
    }

    /// Create a table; an existing table is left untouched
    pub fn create_table(&self, definition: &TableDefinition) -> Result<()> {
        let sql = builder::create_table_sql(definition)?;
        self.executor
            .execute_command(&sql, &Params::None)
            .map_err(|e| {
                tracing::error!("Failed to create table {}: {}", definition.name, e);
                DbError::schema_caused_by(format!("Cannot create table {}", definition.name), e)
            })?;
        tracing::debug!("Created table: {}", definition.name);
        Ok(())
    }

    /// Drop a table; a missing table is not an error
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let sql = builder::drop_table_sql(name)?;
        self.executor
            .execute_command(&sql, &Params::None)
            .map_err(|e| DbError::schema_caused_by(format!("Cannot drop table {}", name), e))?;
        tracing::debug!("Dropped table: {}", name);
        Ok(())
    }

    /// CREATE TABLE statements for the catalog, by table name
    pub fn get_create_table_sql(&self) -> Result<BTreeMap<String, String>> {
        self.catalog
            .tables
            .iter()
            .map(|t| builder::create_table_sql(t).map(|sql| (t.name.clone(), sql)))
            .collect::<Result<BTreeMap<_, _>>>()
            .map_err(|e| DbError::schema_caused_by("Cannot generate table SQL", e))
    }

    /// Compare the live schema with the catalog
    pub fn validate_schema(&self) -> Result<SchemaValidation> {
        let existing = self.get_table_names()?;
        let expected: BTreeSet<String> = self
            .catalog
            .tables
            .iter()
            .map(|t| t.name.clone())
            .collect();

        let missing_tables: Vec<String> = expected.difference(&existing).cloned().collect();
        // the ledger belongs to every schema
        let extra_tables: Vec<String> = existing
            .difference(&expected)
            .filter(|t| t.as_str() != LEDGER_TABLE)
            .cloned()
            .collect();

        let mut column_mismatches = Vec::new();
        for table in &self.catalog.tables {
            if !existing.contains(&table.name) {
                continue;
            }
            let live = match self.get_table_definition(&table.name)? {
                Some(live) => live,
                None => continue,
            };
            let expected_columns: BTreeSet<&str> = table.column_names().into_iter().collect();
            let live_columns: BTreeSet<&str> = live.column_names().into_iter().collect();
            if expected_columns != live_columns {
                column_mismatches.push(ColumnMismatch {
                    table: table.name.clone(),
                    missing_columns: expected_columns
                        .difference(&live_columns)
                        .map(|c| c.to_string())
                        .collect(),
                    extra_columns: live_columns
                        .difference(&expected_columns)
                        .map(|c| c.to_string())
                        .collect(),
                });
            }
        }

        let integrity_violations = self.check_referential_integrity()?;
        let status = if missing_tables.is_empty()
            && extra_tables.is_empty()
            && column_mismatches.is_empty()
            && integrity_violations.is_empty()
        {
            ValidationStatus::Valid
        } else {
            ValidationStatus::Invalid
        };

        Ok(SchemaValidation {
            status,
            missing_tables,
            extra_tables,
            column_mismatches,
            integrity_violations,
            schema_version: self.get_schema_version()?,
        })
    }

    fn check_referential_integrity(&self) -> Result<Vec<String>> {
        let rows = self
            .executor
            .fetch_all("PRAGMA foreign_key_check", &Params::None)
            .map_err(|e| DbError::schema_caused_by("Cannot check foreign keys", e))?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let text = |i: usize| row.get(i).and_then(Value::to_text).unwrap_or_default();
                format!(
                    "{} row {} references missing {} (constraint {})",
                    text(0),
                    text(1),
                    text(2),
                    text(3)
                )
            })
            .collect())
    }

    pub fn get_schema_info(&self) -> Result<SchemaInfo> {
        let tables: Vec<String> = self.get_table_names()?.into_iter().collect();
        Ok(SchemaInfo {
            version: self.get_schema_version()?,
            table_count: tables.len(),
            schema_exists: self.schema_exists()?,
            tables,
        })
    }
}

fn text_at(value: Option<&Value>) -> String {
    value.and_then(Value::to_text).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use crate::database::core::{ConnectionManager, TransactionManager};
    use tempfile::tempdir;

    fn object_names(executor: &QueryExecutor) -> Vec<(String, String)> {
        executor
            .fetch_all(
                "SELECT type, name FROM sqlite_master WHERE name NOT LIKE 'sqlite_%' ORDER BY type, name",
                &Params::None,
            )
            .unwrap()
            .into_iter()
            .map(|row| (text_at(row.first()), text_at(row.get(1))))
            .collect()
    }

    #[test]
    fn test_create_schema_is_idempotent() {
        let conn = ConnectionManager::open_in_memory().unwrap();
        let tm = TransactionManager::new(&conn);
        let executor = QueryExecutor::new(&conn, &tm);
        let manager = SchemaManager::new(&executor);

        assert!(!manager.schema_exists().unwrap());
        assert_eq!(manager.get_schema_version().unwrap(), None);

        manager.create_schema().unwrap();
        let first = object_names(&executor);
        manager.create_schema().unwrap();
        let second = object_names(&executor);

        assert_eq!(first, second);
        assert!(manager.schema_exists().unwrap());
        assert_eq!(
            manager.get_schema_version().unwrap(),
            Some("1.0.0".to_string())
        );
        let views = first.iter().filter(|(kind, _)| kind == "view").count();
        assert_eq!(views, 3);
        let indexes = first
            .iter()
            .filter(|(kind, name)| kind == "index" && name.starts_with("idx_"))
            .count();
        assert_eq!(indexes, manager.catalog().indexes.len());
        assert_eq!(tm.depth(), 0);
    }

    #[test]
    fn test_partial_schema_does_not_exist() {
        let conn = ConnectionManager::open_in_memory().unwrap();
        let tm = TransactionManager::new(&conn);
        let executor = QueryExecutor::new(&conn, &tm);
        let manager = SchemaManager::new(&executor);

        for name in ["assets", "portfolios", "trades"] {
            let table = manager.catalog().table(name).unwrap().clone();
            manager.create_table(&table).unwrap();
        }
        assert!(!manager.schema_exists().unwrap());

        manager.create_schema().unwrap();
        assert!(manager.schema_exists().unwrap());

        manager.drop_table("positions").unwrap();
        assert!(!manager.schema_exists().unwrap());
        // already absent
        manager.drop_table("positions").unwrap();
    }

    #[test]
    fn test_file_backed_scenario() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data/portfolio.sqlite3");
        let conn =
            ConnectionManager::open(path.to_str().unwrap(), ConnectionSettings::default())
                .unwrap();
        let tm = TransactionManager::new(&conn);
        let executor = QueryExecutor::new(&conn, &tm);
        let manager = SchemaManager::new(&executor);

        manager.create_schema().unwrap();
        assert!(manager.schema_exists().unwrap());
        let names = manager.get_table_names().unwrap();
        for table in manager.catalog().table_names() {
            assert!(names.contains(table), "missing {}", table);
        }

        manager.drop_schema().unwrap();
        assert!(!manager.schema_exists().unwrap());
        assert!(manager.get_table_names().unwrap().is_empty());
        assert_eq!(manager.get_schema_version().unwrap(), None);
    }

    #[test]
    fn test_get_table_definition() {
        let conn = ConnectionManager::open_in_memory().unwrap();
        let tm = TransactionManager::new(&conn);
        let executor = QueryExecutor::new(&conn, &tm);
        let manager = SchemaManager::new(&executor);
        manager.create_schema().unwrap();

        let positions = manager.get_table_definition("positions").unwrap().unwrap();
        assert_eq!(
            positions.primary_key,
            vec!["portfolio_id".to_string(), "symbol".to_string()]
        );
        assert_eq!(positions.column_type("qty"), Some("DECIMAL(18,6) NOT NULL"));
        assert_eq!(
            positions.column_type("unit"),
            Some("TEXT NOT NULL DEFAULT 'share'")
        );
        assert!(positions
            .foreign_keys
            .contains(&("symbol".to_string(), "assets.symbol".to_string())));

        assert_eq!(manager.get_table_definition("nope").unwrap(), None);
    }

    #[test]
    fn test_validate_schema() {
        let conn = ConnectionManager::open_in_memory().unwrap();
        let tm = TransactionManager::new(&conn);
        let executor = QueryExecutor::new(&conn, &tm);
        let manager = SchemaManager::new(&executor);
        manager.create_schema().unwrap();

        let report = manager.validate_schema().unwrap();
        assert!(report.is_valid(), "{:?}", report);
        assert_eq!(report.schema_version, Some("1.0.0".to_string()));

        executor
            .execute_script("CREATE TABLE scratch (id INTEGER); ALTER TABLE assets ADD COLUMN sector TEXT")
            .unwrap();
        manager.drop_table("risk_metrics").unwrap();

        let report = manager.validate_schema().unwrap();
        assert_eq!(report.status, ValidationStatus::Invalid);
        assert_eq!(report.missing_tables, vec!["risk_metrics".to_string()]);
        assert_eq!(report.extra_tables, vec!["scratch".to_string()]);
        assert_eq!(report.column_mismatches.len(), 1);
        assert_eq!(report.column_mismatches[0].extra_columns, vec!["sector".to_string()]);
    }

    #[test]
    fn test_schema_info_and_create_sql() {
        let conn = ConnectionManager::open_in_memory().unwrap();
        let tm = TransactionManager::new(&conn);
        let executor = QueryExecutor::new(&conn, &tm);
        let manager = SchemaManager::new(&executor);

        let statements = manager.get_create_table_sql().unwrap();
        assert_eq!(statements.len(), 11);
        assert!(statements["trades"].starts_with("CREATE TABLE IF NOT EXISTS \"trades\""));

        manager.create_schema().unwrap();
        let info = manager.get_schema_info().unwrap();
        assert_eq!(info.table_count, 11);
        assert!(info.tables.contains(&LEDGER_TABLE.to_string()));
        assert!(info.schema_exists);
        assert_eq!(info.version, Some("1.0.0".to_string()));
        let mut sorted = info.tables.clone();
        sorted.sort();
        assert_eq!(info.tables, sorted);
    }

    #[test]
    fn test_custom_catalog() {
        let conn = ConnectionManager::open_in_memory().unwrap();
        let tm = TransactionManager::new(&conn);
        let executor = QueryExecutor::new(&conn, &tm);
        let catalog = SchemaCatalog::new("0.1.0")
            .with_table(
                TableDefinition::new("child")
                    .column("id", "INTEGER PRIMARY KEY")
                    .column("parent_id", "INTEGER NOT NULL")
                    .foreign_key("parent_id", "parent.id"),
            )
            .with_table(TableDefinition::new("parent").column("id", "INTEGER PRIMARY KEY"));
        let manager = SchemaManager::with_catalog(&executor, catalog);

        manager.create_schema().unwrap();
        assert!(manager.schema_exists().unwrap());
        assert_eq!(
            manager.get_schema_version().unwrap(),
            Some("0.1.0".to_string())
        );
        // ledger is created on demand but is not part of this catalog
        assert!(manager.table_exists(LEDGER_TABLE).unwrap());
    }
}
