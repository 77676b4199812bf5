use anyhow::{anyhow, Result};
use config::Config;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// In-memory storage marker accepted wherever a database path is expected
pub const MEMORY_TARGET: &str = ":memory:";

const EMPTY_CONFIG: &str = r#"### portfolio-store configuration file

### directory holding the database file
# data_dir = "~/.portfolio-store"
# database_file = "portfolio.sqlite3"

### connection tuning
# memory_limit = "4GB"
# threads = 4
# timezone = "UTC"
# enable_optimizer = true
# enable_profiling = false
# read_only = false

### extra pragmas applied after tuning, in key order
# [pragmas]
# journal_mode = "WAL"
# busy_timeout = 5000
"#;

/// Value of a connect-time pragma
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PragmaValue {
    Integer(i64),
    Bool(bool),
    Text(String),
}

impl fmt::Display for PragmaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PragmaValue::Integer(v) => write!(f, "{}", v),
            PragmaValue::Bool(true) => write!(f, "ON"),
            PragmaValue::Bool(false) => write!(f, "OFF"),
            PragmaValue::Text(v) => write!(f, "'{}'", v.replace('\'', "''")),
        }
    }
}

/// Connection tuning applied by the connection manager at connect time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Page cache budget, e.g. `4GB`, `512MB`, `64KiB`
    pub memory_limit: String,
    pub threads: u32,
    pub timezone: String,
    pub enable_optimizer: bool,
    pub enable_profiling: bool,
    pub read_only: bool,
    pub pragmas: BTreeMap<String, PragmaValue>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let mut pragmas = BTreeMap::new();
        pragmas.insert(
            "journal_mode".to_string(),
            PragmaValue::Text("WAL".to_string()),
        );
        pragmas.insert(
            "synchronous".to_string(),
            PragmaValue::Text("NORMAL".to_string()),
        );
        pragmas.insert(
            "temp_store".to_string(),
            PragmaValue::Text("MEMORY".to_string()),
        );
        pragmas.insert("foreign_keys".to_string(), PragmaValue::Bool(true));

        Self {
            memory_limit: "4GB".to_string(),
            threads: 4,
            timezone: "UTC".to_string(),
            enable_optimizer: true,
            enable_profiling: false,
            read_only: false,
            pragmas,
        }
    }
}

impl ConnectionSettings {
    /// Ordered connect-time tuning statements
    ///
    /// Order: memory limit, thread count, timezone, optimizer, profiling, then
    /// the pragma map. Settings the engine has no statement for are skipped
    /// with a warning instead of producing a statement that cannot succeed.
    pub fn tuning_statements(&self) -> Vec<String> {
        let mut statements = Vec::new();

        match parse_memory_limit(&self.memory_limit) {
            Some(bytes) => statements.push(format!("PRAGMA cache_size = -{}", bytes / 1024)),
            None => tracing::warn!(
                "Unrecognized memory limit '{}', leaving cache size unchanged",
                self.memory_limit
            ),
        }

        statements.push(format!("PRAGMA threads = {}", self.threads));

        if !is_utc(&self.timezone) {
            tracing::warn!(
                "Timezone '{}' is not supported by the engine, timestamps stay in UTC",
                self.timezone
            );
        }

        if self.enable_optimizer {
            statements.push("PRAGMA automatic_index = ON".to_string());
        }

        // profiling has no engine statement; the query executor raises its log level instead

        for (key, value) in &self.pragmas {
            statements.push(format!("PRAGMA {} = {}", key, value));
        }

        statements
    }
}

impl fmt::Display for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pragmas = self
            .pragmas
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "ConnectionSettings(memory_limit={}, threads={}, timezone={}, optimizer={}, profiling={}, read_only={}, pragmas={{{}}})",
            self.memory_limit,
            self.threads,
            self.timezone,
            self.enable_optimizer,
            self.enable_profiling,
            self.read_only,
            pragmas
        )
    }
}

fn is_utc(timezone: &str) -> bool {
    matches!(
        timezone.trim().to_ascii_uppercase().as_str(),
        "UTC" | "GMT" | "Z" | "ETC/UTC" | "+00:00" | "UTC+0" | "UTC+00:00"
    )
}

/// Parse a human-readable size such as `4GB`, `512 MB`, `64KiB` or `1048576` into bytes
pub fn parse_memory_limit(limit: &str) -> Option<u64> {
    let trimmed = limit.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number: f64 = number.parse().ok()?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "KIB" | "K" => 1024,
        "MB" | "MIB" | "M" => 1024 * 1024,
        "GB" | "GIB" | "G" => 1024 * 1024 * 1024,
        "TB" | "TIB" | "T" => 1024 * 1024 * 1024 * 1024,
        _ => return None,
    };

    let bytes = number * multiplier as f64;
    if !bytes.is_finite() || bytes < 1024.0 {
        return None;
    }
    Some(bytes as u64)
}

/// Store configuration loaded from file and environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the database file
    pub data_dir: String,

    /// Database file name inside `data_dir`, or `:memory:`
    pub database_file: String,

    #[serde(flatten)]
    pub settings: ConnectionSettings,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let home_dir = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());

        Self {
            data_dir: format!("{}/.portfolio-store", home_dir),
            database_file: "portfolio.sqlite3".to_string(),
            settings: ConnectionSettings::default(),
        }
    }
}

impl StoreConfig {
    /// Load the configuration
    ///
    /// Uses the given TOML file, or `$HOME/.portfolio-store/portfolio-store.toml`
    /// by default (created with a commented template when missing), then
    /// applies `PORTFOLIO_STORE_*` environment variables on top.
    pub fn new(path: &Option<String>) -> Result<StoreConfig> {
        let mut builder = Config::builder();

        match path {
            Some(p) => {
                let path = Path::new(p.as_str());
                if path.exists() {
                    let path_str = path
                        .to_str()
                        .ok_or_else(|| anyhow!("Could not convert path to string"))?;
                    builder = builder.add_source(config::File::with_name(path_str));
                } else {
                    std::fs::write(p.as_str(), EMPTY_CONFIG)
                        .map_err(|e| anyhow!("Unable to create config file: {}", e))?;
                }
            }
            None => {
                let p = Self::config_file_path();
                let config_dir = Path::new(&p)
                    .parent()
                    .ok_or_else(|| anyhow!("Invalid config file path: {}", p))?;
                std::fs::create_dir_all(config_dir)
                    .map_err(|e| anyhow!("Unable to create config directory: {}", e))?;
                if Path::new(p.as_str()).exists() {
                    builder = builder.add_source(config::File::with_name(p.as_str()));
                } else {
                    std::fs::write(p.as_str(), EMPTY_CONFIG).map_err(|e| {
                        anyhow!("Unable to create config file {}: {}", p.as_str(), e)
                    })?;
                }
            }
        }

        // e.g. `PORTFOLIO_STORE_THREADS=8 portfolio-store status`
        builder = builder.add_source(
            config::Environment::with_prefix("PORTFOLIO_STORE").try_parsing(true),
        );

        let settings = builder
            .build()
            .map_err(|e| anyhow!("Failed to build configuration: {}", e))?;

        let mut config = settings
            .try_deserialize::<StoreConfig>()
            .map_err(|e| anyhow!("Failed to deserialize configuration: {}", e))?;

        if let Some(stripped) = config.data_dir.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                config.data_dir = home.join(stripped).to_string_lossy().to_string();
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the connection manager cannot apply safely
    pub fn validate(&self) -> Result<()> {
        if self.settings.threads == 0 {
            return Err(anyhow!("threads must be at least 1"));
        }
        for key in self.settings.pragmas.keys() {
            if !crate::database::is_valid_identifier(key) {
                return Err(anyhow!("Invalid pragma name: {}", key));
            }
        }
        Ok(())
    }

    /// Path of the database file, or the in-memory marker
    pub fn database_path(&self) -> String {
        if self.database_file.is_empty() || self.database_file == MEMORY_TARGET {
            return MEMORY_TARGET.to_string();
        }
        let data_dir = self.data_dir.trim_end_matches('/');
        format!("{}/{}", data_dir, self.database_file)
    }

    /// Get the default config file path
    pub fn config_file_path() -> String {
        let home_dir = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| "~".to_string());
        format!("{}/.portfolio-store/portfolio-store.toml", home_dir)
    }

    /// Display configuration summary
    pub fn summary(&self) -> String {
        [
            format!("Data Directory:     {}", self.data_dir),
            format!("Database Path:      {}", self.database_path()),
            format!("Memory Limit:       {}", self.settings.memory_limit),
            format!("Threads:            {}", self.settings.threads),
            format!("Timezone:           {}", self.settings.timezone),
            format!("Read Only:          {}", self.settings.read_only),
        ]
        .join("\n")
    }
}
