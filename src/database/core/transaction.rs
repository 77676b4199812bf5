//! Transaction management
//!
//! SQLite allows one open transaction per connection. Nested scopes are
//! emulated with savepoints: only the outermost scope issues `BEGIN` and
//! `COMMIT`, inner scopes get a uniquely labelled savepoint that can be rolled
//! back without discarding the enclosing work.

use crate::database::core::connection::ConnectionManager;
use crate::database::core::value::validate_identifier;
use crate::database::error::{DbError, Result};
use std::cell::Cell;

/// Savepoint name used when `transaction()` is entered inside a transaction
const NESTED_SAVEPOINT: &str = "nested";

/// Transaction depth and savepoint counter
///
/// `depth` is 0 when no native transaction is open. `aborted` is set once the
/// engine has ended the native transaction underneath an open scope; it clears
/// when the outermost scope exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionState {
    pub depth: u32,
    pub savepoint_counter: u64,
    pub aborted: bool,
}

/// Transaction state machine over a shared connection
///
/// State lives in a `Cell`, so the manager is not `Sync`: one unit of work at
/// a time per connection.
pub struct TransactionManager<'a> {
    connection: &'a ConnectionManager,
    state: Cell<TransactionState>,
}

impl<'a> TransactionManager<'a> {
    pub fn new(connection: &'a ConnectionManager) -> Self {
        TransactionManager {
            connection,
            state: Cell::new(TransactionState::default()),
        }
    }

    pub fn connection(&self) -> &'a ConnectionManager {
        self.connection
    }

    pub fn state(&self) -> TransactionState {
        self.state.get()
    }

    pub fn depth(&self) -> u32 {
        self.state.get().depth
    }

    pub fn is_in_transaction(&self) -> bool {
        self.depth() > 0
    }

    fn set_depth(&self, depth: u32) {
        let mut state = self.state.get();
        state.depth = depth;
        self.state.set(state);
    }

    fn mark_aborted(&self) {
        let mut state = self.state.get();
        if !state.aborted {
            tracing::error!(
                "Native transaction ended under an open scope (depth: {}); refusing further statements",
                state.depth
            );
        }
        state.aborted = true;
        self.state.set(state);
    }

    fn reset(&self) {
        let mut state = self.state.get();
        state.depth = 0;
        state.aborted = false;
        self.state.set(state);
    }

    /// Fail when statements would run outside the scope that issued them
    ///
    /// Some engine errors (`INSERT OR ROLLBACK`, disk full, I/O errors) roll
    /// back the whole native transaction on their own. Inside an open scope
    /// every later statement would then autocommit, so they are refused until
    /// the outermost scope exits.
    pub fn ensure_active(&self) -> Result<()> {
        if self.depth() == 0 {
            return Ok(());
        }
        if !self.state.get().aborted {
            let conn = self.connection.connection()?;
            if !conn.is_autocommit() {
                return Ok(());
            }
            self.mark_aborted();
        }
        Err(DbError::transaction(
            "Transaction was rolled back by the engine; statements are refused until the outermost scope exits",
        ))
    }

    fn next_savepoint_label(&self, name: &str) -> String {
        let mut state = self.state.get();
        state.savepoint_counter += 1;
        self.state.set(state);
        format!("{}_{}", name, state.savepoint_counter)
    }

    fn exec(&self, sql: &str) -> Result<()> {
        let conn = self.connection.connection()?;
        self.connection.record_statement();
        conn.execute_batch(sql)
            .map_err(|e| DbError::query_from(&format!("Failed to execute '{}'", sql), e))
    }

    /// Open a transaction, or deepen the current one
    pub fn begin_transaction(&self) -> Result<()> {
        if let Err(e) = self.connection.connection() {
            return Err(DbError::transaction_caused_by(
                "Cannot begin transaction without a connection",
                e,
            ));
        }

        let depth = self.depth();
        if depth > 0 {
            self.ensure_active()?;
        }
        if depth == 0 {
            self.exec("BEGIN")
                .map_err(|e| DbError::transaction_caused_by("Failed to begin transaction", e))?;
        }
        self.set_depth(depth + 1);
        tracing::debug!("Transaction started (depth: {})", depth + 1);
        Ok(())
    }

    /// Leave one level; commits when the outermost level is left
    ///
    /// A failed commit is rolled back before the error is returned. A
    /// transaction the engine already ended is never reported as committed.
    pub fn commit_transaction(&self) -> Result<()> {
        let depth = self.depth();
        if depth == 0 {
            return Err(DbError::transaction("No transaction in progress"));
        }

        if let Err(e) = self.ensure_active() {
            if depth == 1 {
                self.rollback_transaction();
            } else {
                self.set_depth(depth - 1);
            }
            return Err(e);
        }

        self.set_depth(depth - 1);
        if depth == 1 {
            if let Err(e) = self.exec("COMMIT") {
                tracing::error!("Commit failed, rolling back: {}", e);
                self.rollback_transaction();
                return Err(DbError::transaction_caused_by(
                    "Failed to commit transaction",
                    e,
                ));
            }
        }
        tracing::debug!("Transaction committed (depth: {})", depth - 1);
        Ok(())
    }

    /// Roll back the whole native transaction
    ///
    /// Best-effort: failures are logged and the state is reset regardless.
    pub fn rollback_transaction(&self) {
        let conn = match self.connection.connection() {
            Ok(conn) => conn,
            Err(_) => {
                self.reset();
                return;
            }
        };

        if !conn.is_autocommit() {
            if let Err(e) = self.exec("ROLLBACK") {
                tracing::error!("Failed to rollback transaction: {}", e);
            } else {
                tracing::debug!("Transaction rolled back");
            }
        } else if self.depth() > 0 {
            tracing::debug!("Transaction already rolled back by the engine");
        }
        self.reset();
    }

    /// Run `body` in a transaction scope
    ///
    /// Commits when `body` returns `Ok`, rolls back when it returns `Err` or
    /// panics. Inside an open transaction this becomes a savepoint scope.
    pub fn transaction<T, E, F>(&self, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: From<DbError>,
    {
        if self.is_in_transaction() {
            return self.savepoint(NESTED_SAVEPOINT, body);
        }

        self.begin_transaction()?;
        let mut guard = ScopeGuard::transaction(self);
        let outcome = body();
        guard.disarm();

        match outcome {
            Ok(value) => {
                self.commit_transaction()?;
                Ok(value)
            }
            Err(e) => {
                self.rollback_transaction();
                Err(e)
            }
        }
    }

    /// Run `body` under a savepoint inside the current transaction
    ///
    /// On `Err` the work done since the savepoint is undone and the original
    /// error is returned; the enclosing transaction stays open.
    pub fn savepoint<T, E, F>(&self, name: &str, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: From<DbError>,
    {
        if !self.is_in_transaction() {
            return Err(DbError::transaction("Cannot create savepoint outside of transaction").into());
        }
        validate_identifier(name)?;
        self.ensure_active()?;

        let label = self.next_savepoint_label(name);
        self.exec(&format!("SAVEPOINT \"{}\"", label))
            .map_err(|e| DbError::transaction_caused_by(format!("Failed to create savepoint {}", label), e))?;
        tracing::debug!("Created savepoint: {}", label);

        let mut guard = ScopeGuard::savepoint(self, label.clone());
        let outcome = body();
        guard.disarm();

        match outcome {
            Ok(value) => {
                self.exec(&format!("RELEASE SAVEPOINT \"{}\"", label)).map_err(|e| {
                    self.mark_aborted();
                    DbError::transaction_caused_by(format!("Failed to release savepoint {}", label), e)
                })?;
                tracing::debug!("Released savepoint: {}", label);
                Ok(value)
            }
            Err(e) => {
                self.undo_savepoint(&label)?;
                Err(e)
            }
        }
    }

    fn undo_savepoint(&self, label: &str) -> Result<()> {
        self.ensure_active()?;
        self.exec(&format!("ROLLBACK TO SAVEPOINT \"{}\"", label))
            .and_then(|_| self.exec(&format!("RELEASE SAVEPOINT \"{}\"", label)))
            .map_err(|e| {
                tracing::error!("Failed to rollback to savepoint {}: {}", label, e);
                self.mark_aborted();
                DbError::transaction_caused_by(format!("Failed to rollback to savepoint {}", label), e)
            })?;
        tracing::debug!("Rolled back to savepoint: {}", label);
        Ok(())
    }
}

/// Undoes a scope if its body unwinds
struct ScopeGuard<'m, 'a> {
    manager: &'m TransactionManager<'a>,
    savepoint: Option<String>,
    armed: bool,
}

impl<'m, 'a> ScopeGuard<'m, 'a> {
    fn transaction(manager: &'m TransactionManager<'a>) -> Self {
        ScopeGuard {
            manager,
            savepoint: None,
            armed: true,
        }
    }

    fn savepoint(manager: &'m TransactionManager<'a>, label: String) -> Self {
        ScopeGuard {
            manager,
            savepoint: Some(label),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ScopeGuard<'_, '_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match &self.savepoint {
            Some(label) => {
                if self.manager.undo_savepoint(label).is_err() {
                    self.manager.rollback_transaction();
                }
            }
            None => self.manager.rollback_transaction(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::{Param, Params, QueryExecutor};
    use crate::database::error::FailureKind;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn setup() -> ConnectionManager {
        let manager = ConnectionManager::open_in_memory().unwrap();
        manager
            .connection()
            .unwrap()
            .execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .unwrap();
        manager
    }

    fn insert(conn: &ConnectionManager, id: i64, name: &str) -> Result<()> {
        conn.connection()?
            .execute(
                "INSERT INTO items (id, name) VALUES (?1, ?2)",
                rusqlite::params![id, name],
            )
            .map(|_| ())
            .map_err(|e| DbError::query_from("insert", e))
    }

    fn count(conn: &ConnectionManager) -> i64 {
        conn.connection()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_begin_commit_depth() {
        let conn = setup();
        let tm = TransactionManager::new(&conn);
        assert!(!tm.is_in_transaction());

        tm.begin_transaction().unwrap();
        tm.begin_transaction().unwrap();
        assert_eq!(tm.depth(), 2);
        insert(&conn, 1, "a").unwrap();

        tm.commit_transaction().unwrap();
        assert_eq!(tm.depth(), 1);
        assert!(!conn.connection().unwrap().is_autocommit());

        tm.commit_transaction().unwrap();
        assert_eq!(tm.depth(), 0);
        assert!(conn.connection().unwrap().is_autocommit());
        assert_eq!(count(&conn), 1);
    }

    #[test]
    fn test_commit_without_transaction_fails() {
        let conn = setup();
        let tm = TransactionManager::new(&conn);
        assert!(matches!(
            tm.commit_transaction(),
            Err(DbError::Transaction { .. })
        ));
    }

    #[test]
    fn test_rollback_resets_depth() {
        let conn = setup();
        let tm = TransactionManager::new(&conn);
        tm.begin_transaction().unwrap();
        tm.begin_transaction().unwrap();
        insert(&conn, 1, "a").unwrap();
        tm.rollback_transaction();
        assert_eq!(tm.depth(), 0);
        assert_eq!(count(&conn), 0);

        // nothing open; still fine
        tm.rollback_transaction();
        assert_eq!(tm.depth(), 0);
    }

    #[test]
    fn test_begin_without_connection() {
        let mut conn = ConnectionManager::open_in_memory().unwrap();
        conn.disconnect();
        let tm = TransactionManager::new(&conn);
        assert!(matches!(
            tm.begin_transaction(),
            Err(DbError::Transaction { .. })
        ));
        tm.rollback_transaction();
        assert_eq!(tm.depth(), 0);
    }

    #[test]
    fn test_transaction_scope_commit_and_rollback() {
        let conn = setup();
        let tm = TransactionManager::new(&conn);

        let value: Result<i32> = tm.transaction(|| {
            insert(&conn, 1, "a")?;
            Ok(7)
        });
        assert_eq!(value.unwrap(), 7);
        assert_eq!(count(&conn), 1);

        let failed: Result<()> = tm.transaction(|| {
            insert(&conn, 2, "b")?;
            insert(&conn, 1, "duplicate")?;
            Ok(())
        });
        let err = failed.unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::ConstraintViolation));
        assert_eq!(tm.depth(), 0);
        assert_eq!(count(&conn), 1);
    }

    #[test]
    fn test_nested_transaction_uses_savepoint() {
        let conn = setup();
        let tm = TransactionManager::new(&conn);

        let result: Result<()> = tm.transaction(|| {
            insert(&conn, 1, "outer")?;
            let inner: Result<()> = tm.transaction(|| {
                assert_eq!(tm.depth(), 1);
                insert(&conn, 2, "inner")?;
                Err(DbError::parameter("inner failure"))
            });
            assert!(matches!(inner, Err(DbError::Parameter(_))));
            insert(&conn, 3, "after")?;
            Ok(())
        });
        result.unwrap();

        assert_eq!(tm.depth(), 0);
        assert_eq!(tm.state().savepoint_counter, 1);
        let ids: Vec<i64> = conn
            .connection()
            .unwrap()
            .prepare("SELECT id FROM items ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_savepoint_requires_transaction() {
        let conn = setup();
        let tm = TransactionManager::new(&conn);
        let result: Result<()> = tm.savepoint("s1", || Ok(()));
        assert!(matches!(result, Err(DbError::Transaction { .. })));
    }

    #[test]
    fn test_savepoint_rejects_bad_name() {
        let conn = setup();
        let tm = TransactionManager::new(&conn);
        let result: Result<()> = tm.transaction(|| tm.savepoint("s1; DROP TABLE items", || Ok(())));
        assert!(matches!(result, Err(DbError::Parameter(_))));
        assert_eq!(tm.depth(), 0);
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn test_savepoint_labels_are_distinct() {
        let conn = setup();
        let tm = TransactionManager::new(&conn);

        let result: Result<()> = tm.transaction(|| {
            insert(&conn, 1, "a")?;
            tm.savepoint("s1", || insert(&conn, 2, "b"))?;
            let second: Result<()> = tm.savepoint("s1", || {
                insert(&conn, 3, "c")?;
                insert(&conn, 3, "c again")
            });
            assert!(second.is_err());
            Ok(())
        });
        result.unwrap();

        assert_eq!(tm.state().savepoint_counter, 2);
        assert_eq!(count(&conn), 2);
    }

    #[test]
    fn test_savepoint_scenario() {
        let conn = setup();
        let tm = TransactionManager::new(&conn);

        tm.begin_transaction().unwrap();
        insert(&conn, 1, "row A").unwrap();
        let result: Result<()> = tm.savepoint("s1", || {
            insert(&conn, 2, "row B")?;
            conn.connection()?
                .execute_batch("INSERT INTO missing_table VALUES (1)")
                .map_err(|e| DbError::query_from("forced", e))
        });
        assert_eq!(
            result.unwrap_err().failure_kind(),
            Some(FailureKind::Syntax)
        );
        tm.commit_transaction().unwrap();

        let names: Vec<String> = conn
            .connection()
            .unwrap()
            .prepare("SELECT name FROM items")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(names, vec!["row A".to_string()]);
        assert_eq!(tm.depth(), 0);
    }

    #[test]
    fn test_panic_in_scope_rolls_back() {
        let conn = setup();
        let tm = TransactionManager::new(&conn);

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let _: Result<()> = tm.transaction(|| {
                insert(&conn, 1, "a")?;
                let _: Result<()> = tm.savepoint("inner", || {
                    insert(&conn, 2, "b")?;
                    panic!("boom");
                });
                Ok(())
            });
        }));
        assert!(outcome.is_err());
        assert_eq!(tm.depth(), 0);
        assert!(conn.connection().unwrap().is_autocommit());
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn test_depth_zero_after_mixed_nesting() {
        let conn = setup();
        let tm = TransactionManager::new(&conn);

        for fail_at in 0..4 {
            let _: Result<()> = tm.transaction(|| {
                if fail_at == 0 {
                    return Err(DbError::parameter("level 0"));
                }
                tm.transaction(|| {
                    if fail_at == 1 {
                        return Err(DbError::parameter("level 1"));
                    }
                    tm.savepoint("deep", || {
                        if fail_at == 2 {
                            Err(DbError::parameter("level 2"))
                        } else {
                            Ok(())
                        }
                    })
                })
            });
            assert_eq!(tm.depth(), 0, "fail_at = {}", fail_at);
            assert!(conn.connection().unwrap().is_autocommit());
        }
    }

    #[test]
    fn test_engine_rollback_in_savepoint_aborts_scope() {
        let conn = setup();
        let tm = TransactionManager::new(&conn);
        let executor = QueryExecutor::new(&conn, &tm);
        let insert_sql = "INSERT INTO items (id, name) VALUES (?, ?)";

        let result: Result<()> = tm.transaction(|| {
            executor.execute_command(
                insert_sql,
                &Params::positional([Param::from(1), Param::from("a")]),
            )?;

            // OR ROLLBACK ends the whole native transaction, not just the savepoint
            let inner: Result<usize> = tm.savepoint("s1", || {
                executor.execute_command(
                    "INSERT OR ROLLBACK INTO items (id, name) VALUES (1, 'dup')",
                    &Params::None,
                )
            });
            assert!(matches!(inner, Err(DbError::Transaction { .. })));
            assert!(tm.state().aborted);
            assert_eq!(tm.depth(), 1);

            let after = executor.execute_command(
                insert_sql,
                &Params::positional([Param::from(3), Param::from("c")]),
            );
            assert!(matches!(after, Err(DbError::Transaction { .. })));
            assert!(matches!(
                tm.savepoint("s2", || Ok::<_, DbError>(())),
                Err(DbError::Transaction { .. })
            ));
            Ok(())
        });

        assert!(matches!(result, Err(DbError::Transaction { .. })));
        assert_eq!(tm.state().depth, 0);
        assert!(!tm.state().aborted);
        assert!(conn.connection().unwrap().is_autocommit());
        assert_eq!(count(&conn), 0);

        // the manager is usable again once the outermost scope has exited
        let retry: Result<()> = tm.transaction(|| {
            executor
                .execute_command(
                    insert_sql,
                    &Params::positional([Param::from(5), Param::from("e")]),
                )
                .map(|_| ())
        });
        retry.unwrap();
        assert_eq!(count(&conn), 1);
    }

    #[test]
    fn test_commit_after_engine_rollback_fails() {
        let conn = setup();
        let tm = TransactionManager::new(&conn);
        insert(&conn, 1, "a").unwrap();

        tm.begin_transaction().unwrap();
        tm.begin_transaction().unwrap();
        insert(&conn, 2, "b").unwrap();
        let err = conn
            .connection()
            .unwrap()
            .execute_batch("INSERT OR ROLLBACK INTO items (id, name) VALUES (1, 'dup')");
        assert!(err.is_err());

        assert!(matches!(
            tm.commit_transaction(),
            Err(DbError::Transaction { .. })
        ));
        assert_eq!(tm.depth(), 1);
        assert!(matches!(
            tm.commit_transaction(),
            Err(DbError::Transaction { .. })
        ));
        assert_eq!(tm.state(), TransactionState { savepoint_counter: 0, ..Default::default() });
        assert_eq!(count(&conn), 1);
    }
}
