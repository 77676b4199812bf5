//! Parameter-safe statement execution
//!
//! The [`QueryExecutor`] validates parameter names and converts values before
//! anything reaches the engine, binds them to prepared statements, converts
//! result values back, and times and logs every statement.

use crate::database::core::connection::ConnectionManager;
use crate::database::core::transaction::TransactionManager;
use crate::database::core::value::{is_valid_identifier, Param, Params, Value};
use crate::database::error::{DbError, Result};
use rusqlite::types::Value as EngineValue;
use rusqlite::Statement;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Maximum number of validated names remembered by an executor
const NAME_CACHE_CAPACITY: usize = 1000;

/// Placeholder prefixes accepted for named parameters
const NAMED_PREFIXES: [char; 3] = ['$', ':', '@'];

/// One result row
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Value of a column by name
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.columns.iter().zip(self.values.iter()) {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// Rows returned by a query, with column names and timing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    columns: Vec<String>,
    rows: Vec<Row>,
    #[serde(skip)]
    execution_time: Duration,
}

impl QueryResult {
    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// First column of the first row
    pub fn scalar(&self) -> Option<&Value> {
        self.first().and_then(|row| row.get_index(0))
    }

    pub fn execution_time(&self) -> Duration {
        self.execution_time
    }

    /// Render as a table
    #[cfg(feature = "display")]
    pub fn to_table(&self) -> String {
        use tabled::builder::Builder;
        use tabled::settings::Style;

        let mut builder = Builder::default();
        builder.push_record(self.columns.iter().cloned());
        for row in &self.rows {
            builder.push_record(row.values().iter().map(|v| v.to_string()));
        }
        builder.build().with(Style::rounded()).to_string()
    }
}

/// Result of one statement inside [`QueryExecutor::execute_transaction`]
#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutcome {
    Rows(QueryResult),
    Affected(usize),
}

impl StatementOutcome {
    pub fn rows(&self) -> Option<&QueryResult> {
        match self {
            StatementOutcome::Rows(result) => Some(result),
            StatementOutcome::Affected(_) => None,
        }
    }

    pub fn affected(&self) -> Option<usize> {
        match self {
            StatementOutcome::Rows(_) => None,
            StatementOutcome::Affected(count) => Some(*count),
        }
    }
}

/// Parameters after validation and conversion
enum Bound {
    None,
    Positional(Vec<EngineValue>),
    Named(Vec<(String, EngineValue)>),
}

/// Statement executor over a connection and its transaction manager
pub struct QueryExecutor<'a> {
    connection: &'a ConnectionManager,
    transactions: &'a TransactionManager<'a>,
    validated_names: RefCell<HashSet<String>>,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(connection: &'a ConnectionManager, transactions: &'a TransactionManager<'a>) -> Self {
        QueryExecutor {
            connection,
            transactions,
            validated_names: RefCell::new(HashSet::new()),
        }
    }

    pub fn connection(&self) -> &'a ConnectionManager {
        self.connection
    }

    pub fn transactions(&self) -> &'a TransactionManager<'a> {
        self.transactions
    }

    /// Run a read statement
    pub fn execute_query(&self, sql: &str, params: &Params) -> Result<QueryResult> {
        let started = Instant::now();
        let bound = self.bind_values(params)?;
        let mut stmt = self.prepare(sql)?;
        bind(&mut stmt, &bound)?;

        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
            .into();
        let width = columns.len();

        let mut rows = Vec::new();
        let mut cursor = stmt.raw_query();
        while let Some(row) = cursor
            .next()
            .map_err(|e| DbError::query_from(&failure_context(sql), e))?
        {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                let raw = row
                    .get_ref(i)
                    .map_err(|e| DbError::query_from(&failure_context(sql), e))?;
                values.push(Value::from_engine(raw)?);
            }
            rows.push(Row {
                columns: columns.clone(),
                values,
            });
        }

        let result = QueryResult {
            columns: columns.to_vec(),
            rows,
            execution_time: started.elapsed(),
        };
        self.log_execution(sql, result.execution_time, result.row_count(), "rows");
        Ok(result)
    }

    /// Run a write statement and return the affected row count
    ///
    /// Statements that return rows are drained and report 0.
    pub fn execute_command(&self, sql: &str, params: &Params) -> Result<usize> {
        let started = Instant::now();
        let bound = self.bind_values(params)?;
        let mut stmt = self.prepare(sql)?;
        bind(&mut stmt, &bound)?;

        let affected = if stmt.column_count() > 0 {
            let mut cursor = stmt.raw_query();
            while cursor
                .next()
                .map_err(|e| DbError::query_from(&failure_context(sql), e))?
                .is_some()
            {}
            0
        } else {
            stmt.raw_execute()
                .map_err(|e| DbError::query_from(&failure_context(sql), e))?
        };

        self.log_execution(sql, started.elapsed(), affected, "affected");
        Ok(affected)
    }

    /// Run one statement once per parameter set, atomically
    pub fn execute_batch(&self, sql: &str, param_sets: &[Params]) -> Result<Vec<usize>> {
        if param_sets.is_empty() {
            return Ok(Vec::new());
        }
        // fail before opening the transaction when any set is unusable
        for params in param_sets {
            self.validate_parameters(params)?;
        }

        let started = Instant::now();
        let counts = self.transactions.transaction(|| {
            param_sets
                .iter()
                .map(|params| self.execute_command(sql, params))
                .collect::<Result<Vec<_>>>()
        })?;
        tracing::debug!(
            "Batch of {} executed in {:?}",
            counts.len(),
            started.elapsed()
        );
        Ok(counts)
    }

    /// First column of the first row, if any
    pub fn execute_scalar(&self, sql: &str, params: &Params) -> Result<Option<Value>> {
        let result = self.execute_query(sql, params)?;
        Ok(result.into_rows().into_iter().next().and_then(|row| {
            row.into_values().into_iter().next()
        }))
    }

    /// Run heterogeneous statements atomically
    ///
    /// Statements starting with `SELECT` or `WITH` are run as queries, the
    /// rest as commands. Any failure rolls back every statement of the call.
    pub fn execute_transaction(&self, statements: &[(&str, Params)]) -> Result<Vec<StatementOutcome>> {
        self.transactions
            .transaction(|| {
                let mut outcomes = Vec::with_capacity(statements.len());
                for (sql, params) in statements {
                    let outcome = if is_read_statement(sql) {
                        StatementOutcome::Rows(self.execute_query(sql, params)?)
                    } else {
                        StatementOutcome::Affected(self.execute_command(sql, params)?)
                    };
                    outcomes.push(outcome);
                }
                Ok(outcomes)
            })
            .map_err(|e: DbError| {
                tracing::error!("Transaction of {} statements failed: {}", statements.len(), e);
                DbError::transaction_caused_by("Transaction failed", e)
            })
    }

    /// Run multi-statement SQL without parameters
    pub fn execute_script(&self, sql: &str) -> Result<()> {
        let started = Instant::now();
        self.transactions.ensure_active()?;
        let conn = self.connection.connection()?;
        self.connection.record_statement();
        conn.execute_batch(sql)
            .map_err(|e| DbError::query_from(&failure_context(sql), e))?;
        self.log_execution(sql, started.elapsed(), 0, "script");
        Ok(())
    }

    /// First row as a value vector
    pub fn fetch_one(&self, sql: &str, params: &Params) -> Result<Option<Vec<Value>>> {
        let result = self.execute_query(sql, params)?;
        Ok(result
            .into_rows()
            .into_iter()
            .next()
            .map(Row::into_values))
    }

    /// All rows as value vectors
    pub fn fetch_all(&self, sql: &str, params: &Params) -> Result<Vec<Vec<Value>>> {
        let result = self.execute_query(sql, params)?;
        Ok(result.into_rows().into_iter().map(Row::into_values).collect())
    }

    /// Check names and values without touching the engine
    pub fn validate_parameters(&self, params: &Params) -> Result<()> {
        self.bind_values(params).map(|_| ())
    }

    /// Quote an identifier after validating it
    pub fn escape_identifier(&self, name: &str) -> Result<String> {
        self.validate_name(name)?;
        Ok(format!("\"{}\"", name))
    }

    /// Render a value as a SQL literal
    pub fn format_value(&self, value: &Param) -> Result<String> {
        value.to_sql_literal()
    }

    fn validate_name(&self, name: &str) -> Result<()> {
        if self.validated_names.borrow().contains(name) {
            return Ok(());
        }
        if name.is_empty() {
            return Err(DbError::parameter("Parameter name cannot be empty"));
        }
        if !is_valid_identifier(name) {
            return Err(DbError::parameter(format!("Invalid parameter name: {}", name)));
        }

        let mut cache = self.validated_names.borrow_mut();
        if cache.len() >= NAME_CACHE_CAPACITY {
            cache.clear();
        }
        cache.insert(name.to_string());
        Ok(())
    }

    fn bind_values(&self, params: &Params) -> Result<Bound> {
        Ok(match params {
            Params::None => Bound::None,
            Params::Positional(values) => Bound::Positional(
                values
                    .iter()
                    .map(Param::to_engine)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Params::Named(values) => {
                let mut converted = Vec::with_capacity(values.len());
                for (name, value) in values {
                    let name = name.trim_start_matches(NAMED_PREFIXES);
                    self.validate_name(name)?;
                    converted.push((name.to_string(), value.to_engine()?));
                }
                Bound::Named(converted)
            }
        })
    }

    fn prepare(&self, sql: &str) -> Result<Statement<'a>> {
        self.transactions.ensure_active()?;
        let conn = self.connection.connection()?;
        self.connection.record_statement();
        conn.prepare(sql)
            .map_err(|e| DbError::query_from(&failure_context(sql), e))
    }

    fn log_execution(&self, sql: &str, elapsed: Duration, count: usize, unit: &str) {
        if self.connection.settings().enable_profiling {
            tracing::info!("{:?} ({} {}): {}", elapsed, count, unit, snippet(sql));
        } else {
            tracing::debug!("Statement executed in {:?} ({} {})", elapsed, count, unit);
        }
    }
}

fn bind(stmt: &mut Statement<'_>, bound: &Bound) -> Result<()> {
    let expected = stmt.parameter_count();
    match bound {
        Bound::None => {
            if expected > 0 {
                return Err(DbError::parameter(format!(
                    "Statement expects {} parameters, none given",
                    expected
                )));
            }
        }
        Bound::Positional(values) => {
            if values.len() != expected {
                return Err(DbError::parameter(format!(
                    "Statement expects {} parameters, {} given",
                    expected,
                    values.len()
                )));
            }
            for (i, value) in values.iter().enumerate() {
                stmt.raw_bind_parameter(i + 1, value)
                    .map_err(|e| DbError::parameter(format!("Cannot bind parameter {}: {}", i + 1, e)))?;
            }
        }
        Bound::Named(values) => {
            let mut bound_indexes = HashSet::new();
            for (name, value) in values {
                let index = placeholder_index(stmt, name)?.ok_or_else(|| {
                    DbError::parameter(format!("No placeholder for parameter: {}", name))
                })?;
                stmt.raw_bind_parameter(index, value)
                    .map_err(|e| DbError::parameter(format!("Cannot bind parameter {}: {}", name, e)))?;
                bound_indexes.insert(index);
            }
            for index in 1..=expected {
                if !bound_indexes.contains(&index) {
                    let name = stmt.parameter_name(index).unwrap_or("?").to_string();
                    return Err(DbError::parameter(format!("Missing value for parameter: {}", name)));
                }
            }
        }
    }
    Ok(())
}

fn placeholder_index(stmt: &Statement<'_>, name: &str) -> Result<Option<usize>> {
    for prefix in NAMED_PREFIXES {
        let placeholder = format!("{}{}", prefix, name);
        let index = stmt
            .parameter_index(&placeholder)
            .map_err(|e| DbError::parameter(format!("Invalid parameter name {}: {}", name, e)))?;
        if index.is_some() {
            return Ok(index);
        }
    }
    Ok(None)
}

fn is_read_statement(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    keyword == "SELECT" || keyword == "WITH"
}

fn snippet(sql: &str) -> String {
    let flat = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 120 {
        format!("{}...", flat.chars().take(120).collect::<String>())
    } else {
        flat
    }
}

fn failure_context(sql: &str) -> String {
    format!("Statement failed [{}]", snippet(sql))
}
