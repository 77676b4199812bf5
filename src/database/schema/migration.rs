//! Versioned migrations with a persisted ledger
//!
//! Every applied migration leaves a row in the `schema_migrations` ledger. A
//! failed apply also leaves a row (with `success = false`) so the failure
//! stays visible until the migration is applied successfully.

use crate::database::core::{Param, Params, QueryExecutor, Value};
use crate::database::error::{DbError, Result};
use crate::database::schema::builder;
use crate::database::schema::definitions::ledger_table;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Instant;

const UP_SUFFIX: &str = ".up.sql";
const DOWN_SUFFIX: &str = ".down.sql";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationType {
    CreateTable,
    AlterTable,
    DropTable,
    CreateIndex,
    DropIndex,
    DataMigration,
    SchemaInit,
}

impl MigrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationType::CreateTable => "create_table",
            MigrationType::AlterTable => "alter_table",
            MigrationType::DropTable => "drop_table",
            MigrationType::CreateIndex => "create_index",
            MigrationType::DropIndex => "drop_index",
            MigrationType::DataMigration => "data_migration",
            MigrationType::SchemaInit => "schema_init",
        }
    }

    /// Guess the type from a migration name such as `create_trades`
    pub fn infer(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.starts_with("create_index_") || name.starts_with("index_") {
            MigrationType::CreateIndex
        } else if name.starts_with("drop_index_") {
            MigrationType::DropIndex
        } else if name.starts_with("create_") {
            MigrationType::CreateTable
        } else if name.starts_with("alter_") {
            MigrationType::AlterTable
        } else if name.starts_with("drop_") {
            MigrationType::DropTable
        } else {
            MigrationType::DataMigration
        }
    }
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A reversible schema change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Migration {
    pub version: String,
    pub name: String,
    pub migration_type: MigrationType,
    pub up_sql: String,
    pub down_sql: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub checksum: String,
}

impl Migration {
    pub fn new(
        version: &str,
        name: &str,
        migration_type: MigrationType,
        up_sql: &str,
        down_sql: &str,
        description: &str,
    ) -> Self {
        Migration {
            version: version.to_string(),
            name: name.to_string(),
            migration_type,
            up_sql: up_sql.to_string(),
            down_sql: down_sql.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
            checksum: compute_checksum(up_sql, down_sql),
        }
    }

    pub fn migration_id(&self) -> String {
        format!("{}_{}", self.version, self.name)
    }
}

/// SHA-256 (hex) over the forward and reverse SQL
pub fn compute_checksum(up_sql: &str, down_sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(up_sql.as_bytes());
    hasher.update(down_sql.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Order versions segment by segment
///
/// Segments are split on `.`, `_` and `-`; numeric segments compare as
/// numbers, anything else as text.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |v: &str| -> Vec<String> {
        v.split(['.', '_', '-'])
            .map(|s| s.to_string())
            .collect()
    };
    let (left, right) = (split(a), split(b));

    for (l, r) in left.iter().zip(right.iter()) {
        let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(l), Ok(r)) => l.cmp(&r),
            _ => l.cmp(r),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

/// A ledger row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationLedgerEntry {
    pub version: String,
    pub name: String,
    pub migration_type: String,
    pub applied_at: Option<DateTime<Utc>>,
    pub checksum: String,
    pub execution_time_ms: Option<i64>,
    pub success: bool,
}

/// What a `migrate_to_version` call changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub applied: Vec<String>,
    pub rolled_back: Vec<String>,
}

impl MigrationSummary {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.rolled_back.is_empty()
    }
}

/// Applies and rolls back registered migrations
pub struct MigrationManager<'a> {
    executor: &'a QueryExecutor<'a>,
    registry: Vec<Migration>,
}

impl<'a> MigrationManager<'a> {
    pub fn new(executor: &'a QueryExecutor<'a>) -> Self {
        MigrationManager {
            executor,
            registry: Vec::new(),
        }
    }

    pub fn with_migrations(executor: &'a QueryExecutor<'a>, migrations: Vec<Migration>) -> Self {
        let mut manager = Self::new(executor);
        for migration in migrations {
            manager.register(migration);
        }
        manager
    }

    /// Add a migration to the registry, replacing one with the same version
    pub fn register(&mut self, migration: Migration) {
        if let Some(existing) = self
            .registry
            .iter_mut()
            .find(|m| m.version == migration.version)
        {
            tracing::warn!(
                "Replacing registered migration {} with {}",
                existing.migration_id(),
                migration.migration_id()
            );
            *existing = migration;
        } else {
            self.registry.push(migration);
        }
        self.registry
            .sort_by(|a, b| compare_versions(&a.version, &b.version));
    }

    /// Registered migrations in version order
    pub fn migrations(&self) -> &[Migration] {
        &self.registry
    }

    /// Create the ledger table if it does not exist yet
    pub fn initialize_ledger(&self) -> Result<()> {
        let sql = builder::create_table_sql(&ledger_table())?;
        self.executor
            .execute_command(&sql, &Params::None)
            .map_err(|e| {
                tracing::error!("Failed to initialize migration tracking: {}", e);
                DbError::migration_caused_by("Cannot initialize migration tracking", e)
            })?;
        Ok(())
    }

    /// Versions of successful ledger rows, oldest first
    pub fn get_applied_migrations(&self) -> Result<Vec<String>> {
        self.initialize_ledger()?;
        let rows = self
            .executor
            .fetch_all(
                "SELECT version FROM schema_migrations WHERE success = 1 \
                 ORDER BY applied_at ASC, rowid ASC",
                &Params::None,
            )
            .map_err(|e| DbError::migration_caused_by("Cannot get applied migrations", e))?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().and_then(|v| v.to_text()))
            .collect())
    }

    /// Every ledger row, oldest first
    pub fn get_ledger(&self) -> Result<Vec<MigrationLedgerEntry>> {
        self.initialize_ledger()?;
        let result = self
            .executor
            .execute_query(
                "SELECT version, name, migration_type, applied_at, checksum, execution_time_ms, success \
                 FROM schema_migrations ORDER BY applied_at ASC, rowid ASC",
                &Params::None,
            )
            .map_err(|e| DbError::migration_caused_by("Cannot read migration ledger", e))?;

        Ok(result
            .rows()
            .iter()
            .map(|row| {
                let text = |column: &str| row.get(column).and_then(Value::to_text).unwrap_or_default();
                MigrationLedgerEntry {
                    version: text("version"),
                    name: text("name"),
                    migration_type: text("migration_type"),
                    applied_at: row.get("applied_at").and_then(Value::as_timestamp),
                    checksum: text("checksum"),
                    execution_time_ms: row.get("execution_time_ms").and_then(Value::as_i64),
                    success: row.get("success").and_then(Value::as_bool).unwrap_or(false),
                }
            })
            .collect())
    }

    pub fn is_applied(&self, version: &str) -> Result<bool> {
        Ok(self
            .get_applied_migrations()?
            .iter()
            .any(|applied| applied == version))
    }

    /// Registered migrations that are not applied, in version order
    pub fn get_pending_migrations(&self) -> Result<Vec<Migration>> {
        let applied: HashSet<String> = self.get_applied_migrations()?.into_iter().collect();
        Ok(self
            .registry
            .iter()
            .filter(|m| !applied.contains(&m.version))
            .cloned()
            .collect())
    }

    /// Run the forward SQL and record success
    ///
    /// The SQL and the ledger row commit together. On failure a ledger row with
    /// `success = false` is written on a best-effort basis before the error is
    /// returned.
    pub fn apply_migration(&self, migration: &Migration) -> Result<()> {
        let id = migration.migration_id();
        if self.is_applied(&migration.version)? {
            return Err(DbError::migration(format!(
                "Migration {} is already applied",
                id
            )));
        }

        tracing::info!("Applying migration {}", id);
        let started = Instant::now();
        let outcome = self.executor.transactions().transaction(|| {
            self.executor.execute_script(&migration.up_sql)?;
            self.record(migration, elapsed_ms(started), true)
        });

        match outcome {
            Ok(()) => {
                tracing::info!("Applied migration {} in {} ms", id, elapsed_ms(started));
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to apply migration {}: {}", id, e);
                if let Err(record_error) = self.record(migration, elapsed_ms(started), false) {
                    tracing::warn!(
                        "Could not record failure of migration {}: {}",
                        id,
                        record_error
                    );
                }
                Err(DbError::migration_caused_by(
                    format!("Failed to apply migration {}", id),
                    e,
                ))
            }
        }
    }

    fn record(&self, migration: &Migration, execution_time_ms: i64, success: bool) -> Result<()> {
        self.executor
            .execute_command(
                "INSERT OR REPLACE INTO schema_migrations \
                 (version, name, migration_type, applied_at, checksum, execution_time_ms, success) \
                 VALUES (:version, :name, :migration_type, :applied_at, :checksum, :execution_time_ms, :success)",
                &Params::named([
                    ("version", Param::from(migration.version.as_str())),
                    ("name", Param::from(migration.name.as_str())),
                    ("migration_type", Param::from(migration.migration_type.as_str())),
                    ("applied_at", Param::from(Utc::now())),
                    ("checksum", Param::from(migration.checksum.as_str())),
                    ("execution_time_ms", Param::from(execution_time_ms)),
                    ("success", Param::from(success)),
                ]),
            )
            .map(|_| ())
    }

    /// Run the reverse SQL and delete the ledger row
    pub fn rollback_migration(&self, migration: &Migration) -> Result<()> {
        let id = migration.migration_id();
        if !self.is_applied(&migration.version)? {
            return Err(DbError::migration(format!(
                "Migration {} is not applied",
                id
            )));
        }
        if migration.down_sql.trim().is_empty() {
            return Err(DbError::migration(format!(
                "Migration {} has no rollback SQL",
                id
            )));
        }

        tracing::info!("Rolling back migration {}", id);
        self.executor
            .transactions()
            .transaction(|| {
                self.executor.execute_script(&migration.down_sql)?;
                self.executor.execute_command(
                    "DELETE FROM schema_migrations WHERE version = ?",
                    &Params::positional([migration.version.as_str()]),
                )?;
                Ok(())
            })
            .map_err(|e: DbError| {
                tracing::error!("Failed to rollback migration {}: {}", id, e);
                DbError::migration_caused_by(format!("Failed to rollback migration {}", id), e)
            })?;
        tracing::info!("Rolled back migration {}", id);
        Ok(())
    }

    /// Bring the ledger to `target`
    ///
    /// Without a target every pending migration is applied. With a target,
    /// applied migrations above it are rolled back newest first, then pending
    /// migrations up to and including it are applied.
    pub fn migrate_to_version(&self, target: Option<&str>) -> Result<MigrationSummary> {
        let applied: HashSet<String> = self.get_applied_migrations()?.into_iter().collect();
        let mut summary = MigrationSummary::default();

        if let Some(target) = target {
            let mut above: Vec<&Migration> = self
                .registry
                .iter()
                .filter(|m| {
                    applied.contains(&m.version)
                        && compare_versions(&m.version, target) == Ordering::Greater
                })
                .collect();
            above.sort_by(|a, b| compare_versions(&b.version, &a.version));
            for migration in above {
                self.rollback_migration(migration)?;
                summary.rolled_back.push(migration.version.clone());
            }
        }

        for migration in &self.registry {
            if applied.contains(&migration.version) {
                continue;
            }
            if let Some(target) = target {
                if compare_versions(&migration.version, target) == Ordering::Greater {
                    continue;
                }
            }
            self.apply_migration(migration)?;
            summary.applied.push(migration.version.clone());
        }

        match target {
            Some(target) => tracing::info!(
                "Migrated to version {} ({} applied, {} rolled back)",
                target,
                summary.applied.len(),
                summary.rolled_back.len()
            ),
            None => tracing::info!("Migrated to latest ({} applied)", summary.applied.len()),
        }
        Ok(summary)
    }

    /// False when any ledger row failed, a registered migration's checksum
    /// differs from its ledger row, or the check itself fails
    pub fn validate_migration_integrity(&self) -> bool {
        match self.check_integrity() {
            Ok(valid) => valid,
            Err(e) => {
                tracing::error!("Migration integrity validation failed: {}", e);
                false
            }
        }
    }

    fn check_integrity(&self) -> Result<bool> {
        for entry in self.get_ledger()? {
            if !entry.success {
                tracing::warn!("Migration {} is recorded as failed", entry.version);
                return Ok(false);
            }
            if let Some(migration) = self.registry.iter().find(|m| m.version == entry.version) {
                if migration.checksum != entry.checksum {
                    tracing::warn!(
                        "Checksum mismatch for migration {}: ledger {}, registered {}",
                        entry.version,
                        entry.checksum,
                        migration.checksum
                    );
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Read `<version>_<name>.up.sql` files (with optional `.down.sql`) from `dir`
    pub fn load_migrations_from_directory(dir: impl AsRef<Path>) -> Result<Vec<Migration>> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            DbError::migration(format!(
                "Cannot read migration directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut migrations = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                DbError::migration(format!("Cannot read migration directory entry: {}", e))
            })?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let stem = match file_name.strip_suffix(UP_SUFFIX) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            let (version, name) = match stem.split_once('_') {
                Some((version, name)) if !version.is_empty() && !name.is_empty() => {
                    (version.to_string(), name.to_string())
                }
                _ => {
                    tracing::warn!("Skipping migration file with unexpected name: {}", file_name);
                    continue;
                }
            };

            let up_sql = read_sql(&entry.path())?;
            let down_path = dir.join(format!("{}{}", stem, DOWN_SUFFIX));
            let down_sql = if down_path.exists() {
                read_sql(&down_path)?
            } else {
                String::new()
            };
            let description = up_sql
                .lines()
                .next()
                .and_then(|line| line.trim().strip_prefix("--"))
                .map(|line| line.trim().to_string())
                .unwrap_or_else(|| name.replace('_', " "));

            migrations.push(Migration::new(
                &version,
                &name,
                MigrationType::infer(&name),
                &up_sql,
                &down_sql,
                &description,
            ));
        }

        migrations.sort_by(|a, b| compare_versions(&a.version, &b.version));
        tracing::debug!(
            "Loaded {} migrations from {}",
            migrations.len(),
            dir.display()
        );
        Ok(migrations)
    }
}

fn read_sql(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        DbError::migration(format!("Cannot read migration file {}: {}", path.display(), e))
    })
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::{ConnectionManager, TransactionManager};
    use crate::database::schema::SchemaManager;
    use tempfile::tempdir;

    fn create_watchlist() -> Migration {
        Migration::new(
            "001",
            "create_watchlist",
            MigrationType::CreateTable,
            "CREATE TABLE watchlist (symbol TEXT PRIMARY KEY, added_at TIMESTAMP NOT NULL)",
            "DROP TABLE watchlist",
            "Watchlist of symbols",
        )
    }

    fn add_note_column() -> Migration {
        Migration::new(
            "002",
            "alter_watchlist_note",
            MigrationType::AlterTable,
            "ALTER TABLE watchlist ADD COLUMN note TEXT",
            "ALTER TABLE watchlist DROP COLUMN note",
            "Free-form note",
        )
    }

    fn index_added_at() -> Migration {
        Migration::new(
            "003",
            "index_watchlist_added",
            MigrationType::CreateIndex,
            "CREATE INDEX idx_watchlist_added ON watchlist (added_at)",
            "DROP INDEX idx_watchlist_added",
            "Index on added_at",
        )
    }

    fn table_exists(executor: &QueryExecutor, name: &str) -> bool {
        executor
            .execute_scalar(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = ?",
                &Params::positional([name]),
            )
            .unwrap()
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            > 0
    }

    #[test]
    fn test_checksum() {
        let m = create_watchlist();
        assert_eq!(m.checksum.len(), 64);
        assert_eq!(m.checksum, compute_checksum(&m.up_sql, &m.down_sql));
        assert_ne!(m.checksum, compute_checksum(&m.up_sql, "DROP TABLE other"));
        assert_eq!(m.migration_id(), "001_create_watchlist");
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare_versions("001", "002"), Ordering::Less);
        assert_eq!(compare_versions("2024_01_02", "2024_01_01"), Ordering::Greater);
        assert_eq!(compare_versions("1.0", "1.0.1"), Ordering::Less);
        assert_eq!(compare_versions("1.0.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0.a", "1.0.b"), Ordering::Less);
    }

    #[test]
    fn test_infer_type() {
        assert_eq!(MigrationType::infer("create_trades"), MigrationType::CreateTable);
        assert_eq!(MigrationType::infer("create_index_trades"), MigrationType::CreateIndex);
        assert_eq!(MigrationType::infer("index_trades_symbol"), MigrationType::CreateIndex);
        assert_eq!(MigrationType::infer("drop_index_trades"), MigrationType::DropIndex);
        assert_eq!(MigrationType::infer("alter_trades"), MigrationType::AlterTable);
        assert_eq!(MigrationType::infer("drop_trades"), MigrationType::DropTable);
        assert_eq!(MigrationType::infer("backfill_prices"), MigrationType::DataMigration);
    }

    #[test]
    fn test_apply_and_rollback() {
        let conn = ConnectionManager::open_in_memory().unwrap();
        let tm = TransactionManager::new(&conn);
        let executor = QueryExecutor::new(&conn, &tm);
        let manager = MigrationManager::new(&executor);
        let migration = create_watchlist();

        assert!(manager.get_applied_migrations().unwrap().is_empty());
        manager.apply_migration(&migration).unwrap();
        assert_eq!(manager.get_applied_migrations().unwrap(), vec!["001".to_string()]);
        assert!(table_exists(&executor, "watchlist"));

        let ledger = manager.get_ledger().unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger[0].success);
        assert_eq!(ledger[0].migration_type, "create_table");
        assert_eq!(ledger[0].checksum, migration.checksum);
        assert!(ledger[0].applied_at.is_some());
        assert!(ledger[0].execution_time_ms.is_some());

        // already applied
        assert!(matches!(
            manager.apply_migration(&migration),
            Err(DbError::Migration { .. })
        ));

        manager.rollback_migration(&migration).unwrap();
        assert!(manager.get_applied_migrations().unwrap().is_empty());
        assert!(!table_exists(&executor, "watchlist"));

        // not applied anymore
        assert!(matches!(
            manager.rollback_migration(&migration),
            Err(DbError::Migration { .. })
        ));
        assert!(manager.validate_migration_integrity());
    }

    #[test]
    fn test_failed_apply_is_recorded() {
        let conn = ConnectionManager::open_in_memory().unwrap();
        let tm = TransactionManager::new(&conn);
        let executor = QueryExecutor::new(&conn, &tm);
        let manager = MigrationManager::new(&executor);

        let broken = Migration::new(
            "001",
            "create_broken",
            MigrationType::CreateTable,
            "CREATE TABLE half_done (id INTEGER); INSERT INTO missing_table VALUES (1);",
            "DROP TABLE half_done",
            "Fails halfway",
        );
        assert!(manager.validate_migration_integrity());

        let err = manager.apply_migration(&broken).unwrap_err();
        assert!(matches!(err, DbError::Migration { .. }));
        assert!(!table_exists(&executor, "half_done"));
        assert!(manager.get_applied_migrations().unwrap().is_empty());
        assert!(!manager.validate_migration_integrity());

        let ledger = manager.get_ledger().unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(!ledger[0].success);

        // a successful apply of the same version replaces the failure row
        manager.apply_migration(&create_watchlist()).unwrap();
        assert!(manager.validate_migration_integrity());
        assert_eq!(manager.get_ledger().unwrap().len(), 1);
        assert_eq!(tm.depth(), 0);
    }

    #[test]
    fn test_migrate_to_version() {
        let conn = ConnectionManager::open_in_memory().unwrap();
        let tm = TransactionManager::new(&conn);
        let executor = QueryExecutor::new(&conn, &tm);
        let manager = MigrationManager::with_migrations(
            &executor,
            vec![index_added_at(), create_watchlist(), add_note_column()],
        );
        assert_eq!(
            manager
                .migrations()
                .iter()
                .map(|m| m.version.as_str())
                .collect::<Vec<_>>(),
            vec!["001", "002", "003"]
        );
        assert_eq!(manager.get_pending_migrations().unwrap().len(), 3);

        let summary = manager.migrate_to_version(Some("002")).unwrap();
        assert_eq!(summary.applied, vec!["001".to_string(), "002".to_string()]);
        assert_eq!(manager.get_pending_migrations().unwrap().len(), 1);

        let summary = manager.migrate_to_version(None).unwrap();
        assert_eq!(summary.applied, vec!["003".to_string()]);
        assert!(manager.get_pending_migrations().unwrap().is_empty());

        let summary = manager.migrate_to_version(Some("001")).unwrap();
        assert_eq!(summary.rolled_back, vec!["003".to_string(), "002".to_string()]);
        assert!(summary.applied.is_empty());
        assert_eq!(manager.get_applied_migrations().unwrap(), vec!["001".to_string()]);

        assert!(manager.migrate_to_version(Some("001")).unwrap().is_empty());
    }

    #[test]
    fn test_checksum_mismatch_breaks_integrity() {
        let conn = ConnectionManager::open_in_memory().unwrap();
        let tm = TransactionManager::new(&conn);
        let executor = QueryExecutor::new(&conn, &tm);

        let applier = MigrationManager::new(&executor);
        applier.apply_migration(&create_watchlist()).unwrap();

        let tampered = Migration::new(
            "001",
            "create_watchlist",
            MigrationType::CreateTable,
            "CREATE TABLE watchlist (symbol TEXT PRIMARY KEY)",
            "DROP TABLE watchlist",
            "Edited after the fact",
        );
        let checker = MigrationManager::with_migrations(&executor, vec![tampered]);
        assert!(!checker.validate_migration_integrity());
    }

    #[test]
    fn test_shares_ledger_with_schema_version() {
        let conn = ConnectionManager::open_in_memory().unwrap();
        let tm = TransactionManager::new(&conn);
        let executor = QueryExecutor::new(&conn, &tm);
        let schema = SchemaManager::new(&executor);
        let migrations = MigrationManager::new(&executor);

        schema.create_schema().unwrap();
        assert_eq!(
            migrations.get_applied_migrations().unwrap(),
            vec!["1.0.0".to_string()]
        );

        let ledger = migrations.get_ledger().unwrap();
        assert_eq!(ledger[0].migration_type, "schema_init");
        assert!(migrations.validate_migration_integrity());
    }

    #[test]
    fn test_integrity_fails_closed_without_connection() {
        let mut conn = ConnectionManager::open_in_memory().unwrap();
        conn.disconnect();
        let tm = TransactionManager::new(&conn);
        let executor = QueryExecutor::new(&conn, &tm);
        let manager = MigrationManager::new(&executor);
        assert!(!manager.validate_migration_integrity());
    }

    #[test]
    fn test_load_migrations_from_directory() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("002_alter_watchlist_note.up.sql"),
            "-- Add a note column\nALTER TABLE watchlist ADD COLUMN note TEXT;",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("002_alter_watchlist_note.down.sql"),
            "ALTER TABLE watchlist DROP COLUMN note;",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("001_create_watchlist.up.sql"),
            "CREATE TABLE watchlist (symbol TEXT PRIMARY KEY);",
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "not a migration").unwrap();
        std::fs::write(dir.path().join("noversion.up.sql"), "SELECT 1;").unwrap();

        let migrations = MigrationManager::load_migrations_from_directory(dir.path()).unwrap();
        assert_eq!(migrations.len(), 2);

        assert_eq!(migrations[0].version, "001");
        assert_eq!(migrations[0].name, "create_watchlist");
        assert_eq!(migrations[0].migration_type, MigrationType::CreateTable);
        assert!(migrations[0].down_sql.is_empty());
        assert_eq!(migrations[0].description, "create watchlist");

        assert_eq!(migrations[1].version, "002");
        assert_eq!(migrations[1].migration_type, MigrationType::AlterTable);
        assert_eq!(migrations[1].description, "Add a note column");
        assert!(!migrations[1].down_sql.is_empty());

        assert!(MigrationManager::load_migrations_from_directory(dir.path().join("missing")).is_err());
    }
}
