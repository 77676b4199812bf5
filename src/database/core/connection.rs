//! Database connection management
//!
//! This module owns the single physical engine connection used by the rest of
//! the data-access layer: opening it (with parent directory creation and the
//! read-only flag), applying connect-time tuning, probing it, and describing it.

use crate::config::{ConnectionSettings, MEMORY_TARGET};
use crate::database::error::{DbError, Result};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::cell::Cell;
use std::fmt;
use std::path::{Path, PathBuf};

/// Where the database lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    Memory,
    File(PathBuf),
}

impl StorageTarget {
    /// Parse a path, treating `:memory:` and the empty string as in-memory
    pub fn parse(path: &str) -> Self {
        let trimmed = path.trim();
        if trimmed.is_empty() || trimmed == MEMORY_TARGET {
            StorageTarget::Memory
        } else {
            StorageTarget::File(PathBuf::from(trimmed))
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, StorageTarget::Memory)
    }

    pub fn kind(&self) -> ConnectionKind {
        match self {
            StorageTarget::Memory => ConnectionKind::Memory,
            StorageTarget::File(_) => ConnectionKind::File,
        }
    }
}

impl fmt::Display for StorageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageTarget::Memory => write!(f, "{}", MEMORY_TARGET),
            StorageTarget::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    File,
    Memory,
}

/// Description of a connection, as reported by [`ConnectionManager::get_connection_info`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_kind: Option<ConnectionKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statements_executed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionInfo {
    fn status_only(status: ConnectionStatus) -> Self {
        ConnectionInfo {
            status,
            database_path: None,
            read_only: None,
            engine_version: None,
            database_size: None,
            connection_kind: None,
            settings: None,
            statements_executed: None,
            error: None,
        }
    }
}

/// Owner of the physical engine connection
///
/// Exactly one connection per manager. The handle exists only between
/// [`connect`](Self::connect) and [`disconnect`](Self::disconnect); every
/// statement that reaches the engine through this manager is counted.
pub struct ConnectionManager {
    target: StorageTarget,
    settings: ConnectionSettings,
    conn: Option<Connection>,
    connected: bool,
    statement_count: Cell<u64>,
}

impl ConnectionManager {
    /// Create a manager for a database path without connecting
    pub fn new(path: &str, settings: ConnectionSettings) -> Self {
        ConnectionManager {
            target: StorageTarget::parse(path),
            settings,
            conn: None,
            connected: false,
            statement_count: Cell::new(0),
        }
    }

    /// Create and connect a manager
    pub fn open(path: &str, settings: ConnectionSettings) -> Result<Self> {
        let mut manager = Self::new(path, settings);
        manager.connect()?;
        Ok(manager)
    }

    /// Create and connect an in-memory manager with default settings
    pub fn open_in_memory() -> Result<Self> {
        Self::open(MEMORY_TARGET, ConnectionSettings::default())
    }

    /// Open the connection and apply connect-time tuning
    ///
    /// Tuning failures are logged and ignored; any other failure returns a
    /// connection error and leaves the manager disconnected.
    pub fn connect(&mut self) -> Result<()> {
        if self.connected {
            tracing::debug!("Already connected to {}", self.target);
            return Ok(());
        }

        let conn = self.acquire()?;

        for statement in self.settings.tuning_statements() {
            self.record_statement();
            if let Err(e) = run_drained(&conn, &statement) {
                tracing::warn!("Tuning statement '{}' failed: {}", statement, e);
            }
        }

        self.conn = Some(conn);
        self.connected = true;
        tracing::info!(
            "Connected to {} (read_only={})",
            self.target,
            self.settings.read_only
        );
        Ok(())
    }

    fn acquire(&self) -> Result<Connection> {
        let conn = match &self.target {
            StorageTarget::Memory => {
                if self.settings.read_only {
                    tracing::warn!("Read-only flag ignored for an in-memory database");
                }
                Connection::open_in_memory().map_err(|e| {
                    DbError::connection_from("Failed to create in-memory database", e)
                })?
            }
            StorageTarget::File(path) => {
                if self.settings.read_only {
                    Connection::open_with_flags(
                        path,
                        OpenFlags::SQLITE_OPEN_READ_ONLY
                            | OpenFlags::SQLITE_OPEN_URI
                            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                    )
                    .map_err(|e| {
                        DbError::connection_from(
                            &format!("Failed to open database at '{}' read-only", path.display()),
                            e,
                        )
                    })?
                } else {
                    create_parent_dirs(path)?;
                    Connection::open(path).map_err(|e| {
                        DbError::connection_from(
                            &format!("Failed to open database at '{}'", path.display()),
                            e,
                        )
                    })?
                }
            }
        };

        // opening is lazy; make sure the file really is a database before tuning it
        self.record_statement();
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(|e| DbError::connection_from("Database is not readable", e))?;

        Ok(conn)
    }

    /// Close the connection
    ///
    /// Close failures are logged; the manager is always disconnected afterwards.
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.settings.enable_optimizer && !self.settings.read_only && !self.target.is_memory()
            {
                self.record_statement();
                if let Err(e) = conn.execute_batch("PRAGMA optimize") {
                    tracing::warn!("Optimize before close failed: {}", e);
                }
            }
            if let Err((_, e)) = conn.close() {
                tracing::warn!("Error while closing {}: {}", self.target, e);
            }
            tracing::info!("Disconnected from {}", self.target);
        }
        self.connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.connected && self.conn.is_some()
    }

    /// Trivial round trip; false on any failure
    pub fn ping(&self) -> bool {
        match &self.conn {
            Some(conn) => {
                self.record_statement();
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .map(|v| v == 1)
                    .unwrap_or(false)
            }
            None => false,
        }
    }

    /// Borrow the engine connection
    pub fn connection(&self) -> Result<&Connection> {
        match &self.conn {
            Some(conn) if self.connected => Ok(conn),
            _ => Err(DbError::connection(format!(
                "Not connected to {}",
                self.target
            ))),
        }
    }

    pub fn target(&self) -> &StorageTarget {
        &self.target
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn is_read_only(&self) -> bool {
        self.settings.read_only
    }

    /// Number of statements that reached the engine through this manager
    pub fn statement_count(&self) -> u64 {
        self.statement_count.get()
    }

    pub(crate) fn record_statement(&self) {
        self.statement_count.set(self.statement_count.get() + 1);
    }

    /// Describe the connection
    ///
    /// Never fails: a disconnected manager reports its status only, and an
    /// introspection failure is reported as an `error` status.
    pub fn get_connection_info(&self) -> ConnectionInfo {
        let conn = match self.connection() {
            Ok(conn) => conn,
            Err(_) => return ConnectionInfo::status_only(ConnectionStatus::Disconnected),
        };

        self.record_statement();
        let version = match conn.query_row("SELECT sqlite_version()", [], |row| {
            row.get::<_, String>(0)
        }) {
            Ok(version) => version,
            Err(e) => {
                let mut info = ConnectionInfo::status_only(ConnectionStatus::Error);
                info.error = Some(e.to_string());
                return info;
            }
        };

        let size = match &self.target {
            StorageTarget::File(path) => {
                Some(std::fs::metadata(path).map(|m| m.len()).unwrap_or(0))
            }
            StorageTarget::Memory => None,
        };

        ConnectionInfo {
            status: ConnectionStatus::Connected,
            database_path: Some(self.target.to_string()),
            read_only: Some(self.settings.read_only),
            engine_version: Some(version),
            database_size: size,
            connection_kind: Some(self.target.kind()),
            settings: Some(self.settings.to_string()),
            statements_executed: Some(self.statement_count()),
            error: None,
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn create_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DbError::connection(format!(
                    "Failed to create directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }
    }
    Ok(())
}

/// Run a statement and discard any rows it returns
fn run_drained(conn: &Connection, sql: &str) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.raw_query();
    while rows.next()?.is_some() {}
    Ok(())
}
