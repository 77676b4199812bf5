//! Declarative schema catalog
//!
//! Tables, indexes and views are described as data and turned into SQL by the
//! [`builder`](super::builder) module. [`SchemaCatalog::portfolio`] is the
//! application schema.

use serde::Serialize;

/// Name of the migration ledger table
pub const LEDGER_TABLE: &str = "schema_migrations";

/// Version of the application schema
pub const PORTFOLIO_SCHEMA_VERSION: &str = "1.0.0";

/// A table: ordered columns with type expressions, keys and constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDefinition {
    pub name: String,
    /// Column name and type expression, in declaration order
    pub columns: Vec<(String, String)>,
    pub primary_key: Vec<String>,
    /// Column name and `table.column` reference
    pub foreign_keys: Vec<(String, String)>,
    pub constraints: Vec<String>,
}

impl TableDefinition {
    pub fn new(name: &str) -> Self {
        TableDefinition {
            name: name.to_string(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            constraints: Vec::new(),
        }
    }

    pub fn column(mut self, name: &str, type_expr: &str) -> Self {
        self.columns.push((name.to_string(), type_expr.to_string()));
        self
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn foreign_key(mut self, column: &str, reference: &str) -> Self {
        self.foreign_keys
            .push((column.to_string(), reference.to_string()));
        self
    }

    pub fn constraint(mut self, expr: &str) -> Self {
        self.constraints.push(expr.to_string());
        self
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn column_type(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, type_expr)| type_expr.as_str())
    }

    /// Tables this one references, excluding itself
    pub fn referenced_tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = self
            .foreign_keys
            .iter()
            .filter_map(|(_, reference)| split_reference(reference).map(|(table, _)| table))
            .filter(|table| *table != self.name)
            .collect();
        tables.dedup();
        tables
    }
}

/// Split a `table.column` reference; a bare table name references its key
pub fn split_reference(reference: &str) -> Option<(&str, Option<&str>)> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }
    match reference.split_once('.') {
        Some((table, column)) => Some((table, Some(column))),
        None => Some((reference, None)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexDefinition {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub where_clause: Option<String>,
}

impl IndexDefinition {
    pub fn new(name: &str, table: &str, columns: &[&str]) -> Self {
        IndexDefinition {
            name: name.to_string(),
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
            where_clause: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn filter(mut self, where_clause: &str) -> Self {
        self.where_clause = Some(where_clause.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewDefinition {
    pub name: String,
    pub sql: String,
    pub description: String,
}

impl ViewDefinition {
    pub fn new(name: &str, sql: &str, description: &str) -> Self {
        ViewDefinition {
            name: name.to_string(),
            sql: sql.to_string(),
            description: description.to_string(),
        }
    }
}

/// A complete schema: tables, indexes, views and a semantic version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaCatalog {
    pub version: String,
    pub tables: Vec<TableDefinition>,
    pub indexes: Vec<IndexDefinition>,
    pub views: Vec<ViewDefinition>,
}

impl SchemaCatalog {
    pub fn new(version: &str) -> Self {
        SchemaCatalog {
            version: version.to_string(),
            tables: Vec::new(),
            indexes: Vec::new(),
            views: Vec::new(),
        }
    }

    pub fn with_table(mut self, table: TableDefinition) -> Self {
        self.tables.push(table);
        self
    }

    pub fn with_index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_view(mut self, view: ViewDefinition) -> Self {
        self.views.push(view);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// The portfolio manager schema
    pub fn portfolio() -> Self {
        let mut catalog = SchemaCatalog::new(PORTFOLIO_SCHEMA_VERSION);
        catalog.tables = vec![
            assets_table(),
            asset_snapshots_table(),
            asset_metrics_table(),
            portfolios_table(),
            trades_table(),
            positions_table(),
            strategy_scores_table(),
            portfolio_metrics_table(),
            risk_metrics_table(),
            audit_events_table(),
            ledger_table(),
        ];
        catalog.indexes = portfolio_indexes();
        catalog.views = portfolio_views();
        catalog
    }
}

fn assets_table() -> TableDefinition {
    TableDefinition::new("assets")
        .column("symbol", "TEXT PRIMARY KEY")
        .column("exchange", "TEXT NOT NULL")
        .column(
            "asset_type",
            "TEXT NOT NULL CHECK (asset_type IN ('STOCK', 'ETF', 'CRYPTO', 'COMMODITY'))",
        )
        .column("name", "TEXT NOT NULL")
        .column("created_at", "TIMESTAMP DEFAULT CURRENT_TIMESTAMP")
        .column("updated_at", "TIMESTAMP DEFAULT CURRENT_TIMESTAMP")
        .primary_key(&["symbol"])
        .constraint("CHECK (length(symbol) > 0)")
        .constraint("CHECK (length(exchange) > 0)")
        .constraint("CHECK (length(name) > 0)")
}

fn asset_snapshots_table() -> TableDefinition {
    TableDefinition::new("asset_snapshots")
        .column("symbol", "TEXT NOT NULL")
        .column("timestamp", "TIMESTAMP NOT NULL")
        .column("open", "DECIMAL(18,6) NOT NULL CHECK (open > 0)")
        .column("high", "DECIMAL(18,6) NOT NULL CHECK (high > 0)")
        .column("low", "DECIMAL(18,6) NOT NULL CHECK (low > 0)")
        .column("close", "DECIMAL(18,6) NOT NULL CHECK (close > 0)")
        .column("volume", "BIGINT NOT NULL CHECK (volume >= 0)")
        .column("created_at", "TIMESTAMP DEFAULT CURRENT_TIMESTAMP")
        .primary_key(&["symbol", "timestamp"])
        .foreign_key("symbol", "assets.symbol")
        .constraint("CHECK (high >= low)")
        .constraint("CHECK (high >= open)")
        .constraint("CHECK (high >= close)")
        .constraint("CHECK (low <= open)")
        .constraint("CHECK (low <= close)")
}

fn asset_metrics_table() -> TableDefinition {
    TableDefinition::new("asset_metrics")
        .column("symbol", "TEXT NOT NULL")
        .column("metric_name", "TEXT NOT NULL")
        .column(
            "metric_type",
            "TEXT NOT NULL CHECK (metric_type IN ('FUNDAMENTAL', 'TECHNICAL', 'STRATEGY_SCORE', 'PERFORMANCE', 'RISK'))",
        )
        .column("value", "DECIMAL(18,6) NOT NULL")
        .column("as_of_date", "TIMESTAMP NOT NULL")
        .column("metadata", "TEXT")
        .column("created_at", "TIMESTAMP DEFAULT CURRENT_TIMESTAMP")
        .primary_key(&["symbol", "metric_name", "as_of_date"])
        .foreign_key("symbol", "assets.symbol")
        .constraint("CHECK (length(metric_name) > 0)")
}

fn portfolios_table() -> TableDefinition {
    TableDefinition::new("portfolios")
        .column("portfolio_id", "TEXT PRIMARY KEY")
        .column("name", "TEXT NOT NULL")
        .column(
            "base_ccy",
            "TEXT NOT NULL CHECK (base_ccy IN ('USD', 'EUR', 'RON'))",
        )
        .column(
            "cash_balance",
            "DECIMAL(18,2) NOT NULL CHECK (cash_balance >= 0)",
        )
        .column("created_at", "TIMESTAMP NOT NULL")
        .column("updated_at", "TIMESTAMP DEFAULT CURRENT_TIMESTAMP")
        .primary_key(&["portfolio_id"])
        .constraint("CHECK (length(name) > 0)")
        .constraint("UNIQUE (name)")
}

fn trades_table() -> TableDefinition {
    TableDefinition::new("trades")
        .column("trade_id", "TEXT PRIMARY KEY")
        .column("portfolio_id", "TEXT NOT NULL")
        .column("symbol", "TEXT NOT NULL")
        .column("timestamp", "TIMESTAMP NOT NULL")
        .column("side", "TEXT NOT NULL CHECK (side IN ('BUY', 'SELL'))")
        .column("qty", "DECIMAL(18,6) NOT NULL CHECK (qty > 0)")
        .column("price", "DECIMAL(18,6) NOT NULL CHECK (price > 0)")
        .column("pip_pct", "DECIMAL(8,6) NOT NULL CHECK (pip_pct >= 0)")
        .column("fee_flat", "DECIMAL(18,2) NOT NULL CHECK (fee_flat >= 0)")
        .column("fee_pct", "DECIMAL(8,6) NOT NULL CHECK (fee_pct >= 0)")
        .column("unit", "TEXT NOT NULL DEFAULT 'share'")
        .column("price_ccy", "TEXT NOT NULL")
        .column("comment", "TEXT")
        .column("created_at", "TIMESTAMP DEFAULT CURRENT_TIMESTAMP")
        .primary_key(&["trade_id"])
        .foreign_key("portfolio_id", "portfolios.portfolio_id")
        .foreign_key("symbol", "assets.symbol")
        .constraint("CHECK (length(unit) > 0)")
        .constraint("CHECK (length(price_ccy) > 0)")
}

fn positions_table() -> TableDefinition {
    TableDefinition::new("positions")
        .column("portfolio_id", "TEXT NOT NULL")
        .column("symbol", "TEXT NOT NULL")
        .column("qty", "DECIMAL(18,6) NOT NULL")
        .column("avg_cost", "DECIMAL(18,6) NOT NULL CHECK (avg_cost > 0)")
        .column("unit", "TEXT NOT NULL DEFAULT 'share'")
        .column("price_ccy", "TEXT NOT NULL")
        .column("last_updated", "TIMESTAMP NOT NULL")
        .column("created_at", "TIMESTAMP DEFAULT CURRENT_TIMESTAMP")
        .primary_key(&["portfolio_id", "symbol"])
        .foreign_key("portfolio_id", "portfolios.portfolio_id")
        .foreign_key("symbol", "assets.symbol")
        .constraint("CHECK (length(unit) > 0)")
        .constraint("CHECK (length(price_ccy) > 0)")
}

fn strategy_scores_table() -> TableDefinition {
    TableDefinition::new("strategy_scores")
        .column("strategy_name", "TEXT NOT NULL")
        .column("symbol", "TEXT NOT NULL")
        .column(
            "score",
            "DECIMAL(8,2) NOT NULL CHECK (score >= 0 AND score <= 100)",
        )
        .column("as_of_date", "TIMESTAMP NOT NULL")
        .column("metadata", "TEXT")
        .column("created_at", "TIMESTAMP DEFAULT CURRENT_TIMESTAMP")
        .primary_key(&["strategy_name", "symbol", "as_of_date"])
        .foreign_key("symbol", "assets.symbol")
        .constraint("CHECK (length(strategy_name) > 0)")
}

fn portfolio_metrics_table() -> TableDefinition {
    TableDefinition::new("portfolio_metrics")
        .column("portfolio_id", "TEXT NOT NULL")
        .column("metric_name", "TEXT NOT NULL")
        .column("value", "DECIMAL(18,6) NOT NULL")
        .column("as_of_date", "TIMESTAMP NOT NULL")
        .column("metadata", "TEXT")
        .column("created_at", "TIMESTAMP DEFAULT CURRENT_TIMESTAMP")
        .primary_key(&["portfolio_id", "metric_name", "as_of_date"])
        .foreign_key("portfolio_id", "portfolios.portfolio_id")
        .constraint("CHECK (length(metric_name) > 0)")
}

fn risk_metrics_table() -> TableDefinition {
    TableDefinition::new("risk_metrics")
        .column("entity_id", "TEXT NOT NULL")
        .column(
            "entity_type",
            "TEXT NOT NULL CHECK (entity_type IN ('ASSET', 'PORTFOLIO'))",
        )
        .column("metric_name", "TEXT NOT NULL")
        .column("value", "DECIMAL(18,6) NOT NULL")
        .column("as_of_date", "TIMESTAMP NOT NULL")
        .column("metadata", "TEXT")
        .column("created_at", "TIMESTAMP DEFAULT CURRENT_TIMESTAMP")
        .primary_key(&["entity_id", "entity_type", "metric_name", "as_of_date"])
        .constraint("CHECK (length(entity_id) > 0)")
        .constraint("CHECK (length(metric_name) > 0)")
}

fn audit_events_table() -> TableDefinition {
    TableDefinition::new("audit_events")
        .column("event_id", "TEXT PRIMARY KEY")
        .column("event_type", "TEXT NOT NULL")
        .column(
            "severity",
            "TEXT NOT NULL CHECK (severity IN ('DEBUG', 'INFO', 'WARNING', 'ERROR', 'CRITICAL'))",
        )
        .column("message", "TEXT NOT NULL")
        .column("entity_id", "TEXT")
        .column("user_id", "TEXT")
        .column("session_id", "TEXT")
        .column("timestamp", "TIMESTAMP NOT NULL")
        .column("details", "TEXT")
        .column("created_at", "TIMESTAMP DEFAULT CURRENT_TIMESTAMP")
        .primary_key(&["event_id"])
        .constraint("CHECK (length(event_type) > 0)")
        .constraint("CHECK (length(message) > 0)")
}

/// The migration ledger, shared by the schema and migration managers
pub fn ledger_table() -> TableDefinition {
    TableDefinition::new(LEDGER_TABLE)
        .column("version", "TEXT PRIMARY KEY")
        .column("name", "TEXT NOT NULL")
        .column("migration_type", "TEXT NOT NULL")
        .column("applied_at", "TIMESTAMP NOT NULL")
        .column("checksum", "TEXT NOT NULL")
        .column("execution_time_ms", "INTEGER")
        .column("success", "BOOLEAN NOT NULL DEFAULT TRUE")
        .primary_key(&["version"])
        .constraint("CHECK (length(name) > 0)")
        .constraint("CHECK (length(checksum) > 0)")
        .constraint("CHECK (execution_time_ms >= 0)")
}

fn portfolio_indexes() -> Vec<IndexDefinition> {
    vec![
        IndexDefinition::new("idx_assets_type", "assets", &["asset_type"]),
        IndexDefinition::new("idx_assets_exchange", "assets", &["exchange"]),
        // time-series access
        IndexDefinition::new(
            "idx_snapshots_symbol_time",
            "asset_snapshots",
            &["symbol", "timestamp"],
        ),
        IndexDefinition::new("idx_snapshots_timestamp", "asset_snapshots", &["timestamp"]),
        IndexDefinition::new(
            "idx_metrics_symbol_type",
            "asset_metrics",
            &["symbol", "metric_type"],
        ),
        IndexDefinition::new("idx_metrics_date", "asset_metrics", &["as_of_date"]),
        IndexDefinition::new("idx_portfolios_currency", "portfolios", &["base_ccy"]),
        IndexDefinition::new(
            "idx_trades_portfolio_time",
            "trades",
            &["portfolio_id", "timestamp"],
        ),
        IndexDefinition::new("idx_trades_symbol", "trades", &["symbol"]),
        IndexDefinition::new("idx_trades_timestamp", "trades", &["timestamp"]),
        IndexDefinition::new("idx_positions_portfolio", "positions", &["portfolio_id"]),
        IndexDefinition::new("idx_positions_symbol", "positions", &["symbol"]),
        IndexDefinition::new(
            "idx_scores_strategy_date",
            "strategy_scores",
            &["strategy_name", "as_of_date"],
        ),
        IndexDefinition::new("idx_scores_symbol", "strategy_scores", &["symbol"]),
        IndexDefinition::new(
            "idx_portfolio_metrics_id_date",
            "portfolio_metrics",
            &["portfolio_id", "as_of_date"],
        ),
        IndexDefinition::new(
            "idx_risk_metrics_entity",
            "risk_metrics",
            &["entity_id", "entity_type"],
        ),
        IndexDefinition::new("idx_audit_timestamp", "audit_events", &["timestamp"]),
        IndexDefinition::new("idx_audit_entity", "audit_events", &["entity_id"])
            .filter("entity_id IS NOT NULL"),
        IndexDefinition::new(
            "idx_audit_type_severity",
            "audit_events",
            &["event_type", "severity"],
        ),
        IndexDefinition::new("idx_migrations_version", LEDGER_TABLE, &["version"]).unique(),
    ]
}

fn portfolio_views() -> Vec<ViewDefinition> {
    vec![
        ViewDefinition::new(
            "portfolio_summary",
            r#"
            SELECT
                p.portfolio_id,
                p.name,
                p.base_ccy,
                p.cash_balance,
                COUNT(pos.symbol) AS position_count,
                SUM(pos.qty * pos.avg_cost) AS invested_value,
                p.cash_balance + COALESCE(SUM(pos.qty * pos.avg_cost), 0) AS total_value
            FROM portfolios p
            LEFT JOIN positions pos ON p.portfolio_id = pos.portfolio_id
            WHERE pos.qty > 0 OR pos.qty IS NULL
            GROUP BY p.portfolio_id, p.name, p.base_ccy, p.cash_balance
            "#,
            "Portfolios with position counts and values",
        ),
        ViewDefinition::new(
            "latest_asset_prices",
            r#"
            SELECT
                s.symbol,
                s.close AS latest_price,
                s.timestamp AS price_timestamp
            FROM asset_snapshots s
            WHERE s.timestamp = (
                SELECT MAX(timestamp) FROM asset_snapshots WHERE symbol = s.symbol
            )
            "#,
            "Latest price for each asset",
        ),
        ViewDefinition::new(
            "daily_portfolio_performance",
            r#"
            SELECT
                portfolio_id,
                DATE(timestamp) AS date,
                SUM(CASE WHEN side = 'BUY' THEN qty * price ELSE -qty * price END) AS net_flow,
                COUNT(*) AS trade_count
            FROM trades
            GROUP BY portfolio_id, DATE(timestamp)
            ORDER BY portfolio_id, date
            "#,
            "Daily trading activity and cash flows by portfolio",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_portfolio_catalog() {
        let catalog = SchemaCatalog::portfolio();
        assert_eq!(catalog.version, "1.0.0");
        assert_eq!(catalog.tables.len(), 11);
        assert_eq!(catalog.views.len(), 3);
        assert!(catalog.table(LEDGER_TABLE).is_some());

        let names: HashSet<&str> = catalog.table_names().into_iter().collect();
        for index in &catalog.indexes {
            assert!(names.contains(index.table.as_str()), "{}", index.name);
        }
        for table in &catalog.tables {
            for (column, reference) in &table.foreign_keys {
                assert!(table.column_type(column).is_some());
                let (referenced, _) = split_reference(reference).unwrap();
                assert!(names.contains(referenced), "{} -> {}", table.name, reference);
            }
        }
    }

    #[test]
    fn test_referenced_tables() {
        let catalog = SchemaCatalog::portfolio();
        let trades = catalog.table("trades").unwrap();
        assert_eq!(trades.referenced_tables(), vec!["portfolios", "assets"]);
        assert!(catalog.table("assets").unwrap().referenced_tables().is_empty());
    }

    #[test]
    fn test_split_reference() {
        assert_eq!(
            split_reference("assets.symbol"),
            Some(("assets", Some("symbol")))
        );
        assert_eq!(split_reference("assets"), Some(("assets", None)));
        assert_eq!(split_reference("  "), None);
    }
}
