use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use portfolio_store::database::{MigrationLedgerEntry, Params, QueryResult, StatementOutcome};
use portfolio_store::*;
use serde::Serialize;
use std::path::PathBuf;
use tabled::builder::Builder;
use tabled::settings::Style;
use tracing::Level;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// configuration file path, by default $HOME/.portfolio-store/portfolio-store.toml is used
    #[clap(short, long)]
    config: Option<String>,

    /// Print debug information
    #[clap(long)]
    debug: bool,

    /// Output as JSON
    #[clap(long, global = true)]
    json: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show connection and schema status
    Status,

    /// Create the portfolio schema and record its version
    Init,

    /// Drop every table, index and view of the portfolio schema
    Drop {
        /// Skip confirmation
        #[clap(long, short = 'y')]
        yes: bool,
    },

    /// Validate the live schema against the catalog
    Validate,

    /// List tables with their CREATE statements
    Tables {
        /// Print CREATE statements too
        #[clap(long)]
        sql: bool,
    },

    /// Apply migrations from a directory
    Migrate {
        /// Directory holding <version>_<name>.up.sql / .down.sql files
        #[clap(long, short)]
        dir: PathBuf,

        /// Migrate up or down to this version instead of the latest
        #[clap(long, short)]
        target: Option<String>,
    },

    /// Roll back one migration
    Rollback {
        /// Directory holding <version>_<name>.up.sql / .down.sql files
        #[clap(long, short)]
        dir: PathBuf,

        /// Version to roll back
        version: String,
    },

    /// Show the migration ledger
    History {
        /// Directory to check ledger checksums against
        #[clap(long, short)]
        dir: Option<PathBuf>,
    },

    /// Run SQL statements in one transaction and print the results
    Query {
        /// SQL statements, each run in order
        #[clap(required = true)]
        sql: Vec<String>,
    },
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    let config = match StoreConfig::new(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli.command, &config, cli.json) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands, config: &StoreConfig, json: bool) -> Result<()> {
    let conn = ConnectionManager::open(&config.database_path(), config.settings.clone())?;
    let transactions = TransactionManager::new(&conn);
    let executor = QueryExecutor::new(&conn, &transactions);
    let schema = SchemaManager::new(&executor);

    match command {
        Commands::Status => {
            let info = conn.get_connection_info();
            let schema_info = schema.get_schema_info()?;
            let integrity = MigrationManager::new(&executor).validate_migration_integrity();
            if json {
                print_json(&serde_json::json!({
                    "connection": info,
                    "schema": schema_info,
                    "migration_integrity": integrity,
                }))?;
            } else {
                println!("{}", config.summary());
                println!();
                let mut builder = Builder::default();
                builder.push_record(["Property", "Value"]);
                builder.push_record(["status".to_string(), format!("{:?}", info.status)]);
                if let Some(version) = &info.engine_version {
                    builder.push_record(["engine".to_string(), version.clone()]);
                }
                if let Some(size) = info.database_size {
                    builder.push_record(["size (bytes)".to_string(), size.to_string()]);
                }
                builder.push_record([
                    "schema version".to_string(),
                    schema_info.version.unwrap_or_else(|| "-".to_string()),
                ]);
                builder.push_record([
                    "schema complete".to_string(),
                    schema_info.schema_exists.to_string(),
                ]);
                builder.push_record(["tables".to_string(), schema_info.table_count.to_string()]);
                builder.push_record([
                    "migration integrity".to_string(),
                    if integrity { "ok" } else { "FAILED" }.to_string(),
                ]);
                println!("{}", builder.build().with(Style::rounded()));
            }
        }
        Commands::Init => {
            schema.create_schema()?;
            let info = schema.get_schema_info()?;
            if json {
                print_json(&info)?;
            } else {
                println!(
                    "Schema {} created ({} tables)",
                    info.version.unwrap_or_default(),
                    info.table_count
                );
            }
        }
        Commands::Drop { yes } => {
            if !yes {
                return Err(anyhow!(
                    "Refusing to drop the schema of {} without --yes",
                    config.database_path()
                ));
            }
            schema.drop_schema()?;
            println!("Schema dropped");
        }
        Commands::Validate => {
            let validation = schema.validate_schema()?;
            if json {
                print_json(&validation)?;
            } else {
                println!("Status: {:?}", validation.status);
                for table in &validation.missing_tables {
                    println!("  missing table: {}", table);
                }
                for table in &validation.extra_tables {
                    println!("  extra table:   {}", table);
                }
                for mismatch in &validation.column_mismatches {
                    println!(
                        "  {}: missing {:?}, extra {:?}",
                        mismatch.table, mismatch.missing_columns, mismatch.extra_columns
                    );
                }
                for violation in &validation.integrity_violations {
                    println!("  integrity: {}", violation);
                }
            }
            if !validation.is_valid() {
                return Err(anyhow!("Schema does not match the catalog"));
            }
        }
        Commands::Tables { sql } => {
            let statements = schema.get_create_table_sql()?;
            if json {
                print_json(&statements)?;
            } else if sql {
                for statement in statements.values() {
                    println!("{};\n", statement);
                }
            } else {
                for name in statements.keys() {
                    println!("{}", name);
                }
            }
        }
        Commands::Migrate { dir, target } => {
            let migrations = MigrationManager::with_migrations(
                &executor,
                MigrationManager::load_migrations_from_directory(&dir)?,
            );
            let summary = migrations.migrate_to_version(target.as_deref())?;
            if json {
                print_json(&summary)?;
            } else if summary.is_empty() {
                println!("Nothing to migrate");
            } else {
                for version in &summary.rolled_back {
                    println!("rolled back {}", version);
                }
                for version in &summary.applied {
                    println!("applied     {}", version);
                }
            }
        }
        Commands::Rollback { dir, version } => {
            let migrations = MigrationManager::with_migrations(
                &executor,
                MigrationManager::load_migrations_from_directory(&dir)?,
            );
            let migration = migrations
                .migrations()
                .iter()
                .find(|m| m.version == version)
                .ok_or_else(|| anyhow!("No migration with version {} in {}", version, dir.display()))?;
            migrations.rollback_migration(migration)?;
            println!("rolled back {}", migration.migration_id());
        }
        Commands::History { dir } => {
            let registered = match dir {
                Some(dir) => MigrationManager::load_migrations_from_directory(dir)?,
                None => Vec::new(),
            };
            let migrations = MigrationManager::with_migrations(&executor, registered);
            let ledger = migrations.get_ledger()?;
            let intact = migrations.validate_migration_integrity();
            if json {
                print_json(&serde_json::json!({
                    "migrations": ledger,
                    "integrity": intact,
                }))?;
            } else {
                println!("{}", ledger_table(&ledger));
                println!("Integrity: {}", if intact { "ok" } else { "FAILED" });
            }
        }
        Commands::Query { sql } => {
            let statements: Vec<(&str, Params)> =
                sql.iter().map(|s| (s.as_str(), Params::None)).collect();
            let outcomes = executor.execute_transaction(&statements)?;
            for outcome in outcomes {
                match outcome {
                    StatementOutcome::Rows(result) => print_result(&result, json)?,
                    StatementOutcome::Affected(n) => {
                        if json {
                            print_json(&serde_json::json!({ "affected": n }))?;
                        } else {
                            println!("{} row(s) affected", n);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_result(result: &QueryResult, json: bool) -> Result<()> {
    if json {
        return print_json(result);
    }
    println!("{}", result.to_table());
    println!(
        "{} row(s) in {:.3} ms",
        result.row_count(),
        result.execution_time().as_secs_f64() * 1000.0
    );
    Ok(())
}

fn ledger_table(ledger: &[MigrationLedgerEntry]) -> String {
    let mut builder = Builder::default();
    builder.push_record(["version", "name", "type", "applied_at", "ms", "success"]);
    for entry in ledger {
        builder.push_record([
            entry.version.clone(),
            entry.name.clone(),
            entry.migration_type.clone(),
            entry
                .applied_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
            entry
                .execution_time_ms
                .map(|ms| ms.to_string())
                .unwrap_or_default(),
            entry.success.to_string(),
        ]);
    }
    builder.build().with(Style::rounded()).to_string()
}
