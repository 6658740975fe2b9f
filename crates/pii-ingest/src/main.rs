//! pii-ingest command-line interface

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pii_ingest_core::{
    anonymize, load_and_pseudonymize, validate_schema, AnonymizeOptions, Config, PipelineSummary,
    Store, TenantFailure, TenantPipeline,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, env = "PII_INGEST_CONFIG", help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "PII_INGEST_LOG_LEVEL", default_value = "info", help = "Log level (error, warn, info, debug, trace)")]
    pub log_level: String,

    #[arg(long, env = "PII_INGEST_SALT", hide_env_values = true, help = "Salt for pseudonymization (overrides the configuration file)")]
    pub salt: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, validate and load every configured tenant
    Run {
        #[arg(long, action = clap::ArgAction::Append, help = "Only run these tenants")]
        tenant: Vec<String>,
    },
    /// Drop and recreate an empty tenant table
    CreateTable { name: String },
    /// Check a CSV file's header against the column contract
    Validate { file: PathBuf },
    /// Load a CSV file into a table, hashing the PII column
    Load { file: PathBuf, table: String },
    /// Hash columns of an existing table in place
    Anonymize {
        table: String,
        #[arg(long = "column", required = true, action = clap::ArgAction::Append)]
        columns: Vec<String>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        pk_column: Option<String>,
        #[arg(long, help = "Record progress so the run can resume and is never repeated")]
        checkpoint: bool,
    },
    /// List tables in the database
    Tables,
    /// Show the columns of one table, or of every table
    Describe { table: Option<String> },
}

impl Args {
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match self.config.as_ref() {
            Some(config_path) => {
                info!("Loading configuration from: {}", config_path.display());
                Config::from_file(config_path)
                    .with_context(|| format!("Failed to load {}", config_path.display()))?
            }
            None => match Config::get_default_config_path() {
                Ok(default_path) if default_path.exists() => {
                    info!("Loading configuration from default location: {}", default_path.display());
                    Config::from_file(&default_path)?
                }
                Ok(default_path) => {
                    info!("Creating default configuration at: {}", default_path.display());
                    let mut config = Config::default();
                    config.resolve_paths()?;
                    config.to_file(&default_path)?;
                    config
                }
                Err(_) => {
                    info!("Using default configuration (could not determine config directory)");
                    let mut config = Config::default();
                    config.resolve_paths()?;
                    config
                }
            },
        };

        if let Some(salt) = &self.salt {
            config.pseudonymization.salt = Some(salt.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", level);
        EnvFilter::new("info")
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = args.load_config()?;
    info!("Configuration validated successfully");

    match args.command {
        Command::Run { tenant } => {
            let tenants = if tenant.is_empty() {
                config.ingest.tenants.clone()
            } else {
                tenant
            };
            let pipeline = Arc::new(TenantPipeline::new(&config, config.salt()?));
            let summary =
                run_tenants(pipeline, tenants, config.ingest.max_concurrent_tenants).await?;

            info!(
                "Pipeline finished: {} tenants loaded ({} rows), {} failed",
                summary.succeeded.len(),
                summary.total_rows(),
                summary.failed.len()
            );
            if !summary.is_success() {
                let names: Vec<&str> = summary.failed.iter().map(|f| f.tenant.as_str()).collect();
                anyhow::bail!("Pipeline failed for tenants: {}", names.join(", "));
            }
        }
        Command::CreateTable { name } => {
            let mut store = Store::open(&config.storage)?;
            store.create_table(&name)?;
        }
        Command::Validate { file } => {
            validate_schema(&file)?;
            println!("{}: schema OK", file.display());
        }
        Command::Load { file, table } => {
            let mut store = Store::open(&config.storage)?;
            let rows = load_and_pseudonymize(
                &mut store,
                &file,
                &table,
                &config.salt()?,
                &config.pseudonymization.pii_column,
            )?;
            println!("{} rows loaded into {}", rows, table);
        }
        Command::Anonymize {
            table,
            columns,
            batch_size,
            pk_column,
            checkpoint,
        } => {
            if !checkpoint {
                warn!("Running without --checkpoint: a repeated run will hash the digests again");
            }
            let mut store = Store::open(&config.storage)?;
            let options = AnonymizeOptions {
                pk_column,
                checkpoint,
            };
            let report = anonymize(
                &mut store,
                &table,
                &columns,
                &config.salt()?,
                batch_size.unwrap_or(config.pseudonymization.batch_size),
                &options,
            )?;
            println!(
                "{} rows updated in {} ({} pages, key '{}')",
                report.rows_updated,
                report.table,
                report.pages.len(),
                report.primary_key
            );
        }
        Command::Tables => {
            let store = Store::open(&config.storage)?;
            for table in store.list_tables()? {
                println!("{}", table);
            }
        }
        Command::Describe { table } => {
            let store = Store::open(&config.storage)?;
            print_description(&store, table.as_deref())?;
        }
    }

    Ok(())
}

fn print_description(store: &Store, table: Option<&str>) -> Result<()> {
    match table {
        Some(table) => {
            for column in store.table_info(table)? {
                let marker = if column.primary_key_position > 0 { " (pk)" } else { "" };
                println!("{} {}{}", column.name, column.declared_type, marker);
            }
        }
        None => {
            for line in store.database_summary()? {
                println!("{}", line);
            }
        }
    }
    Ok(())
}

/// Run tenant pipelines on the blocking pool, at most `max_concurrent` at once.
async fn run_tenants(
    pipeline: Arc<TenantPipeline>,
    tenants: Vec<String>,
    max_concurrent: usize,
) -> Result<PipelineSummary> {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut handles = Vec::with_capacity(tenants.len());

    for tenant in tenants {
        let permit = semaphore.clone().acquire_owned().await?;
        let pipeline = pipeline.clone();
        let name = tenant.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            pipeline.run_tenant(&name)
        });
        handles.push((tenant, handle));
    }

    let mut summary = PipelineSummary::default();
    for (tenant, handle) in handles {
        match handle.await {
            Ok(outcome) => summary.record(&tenant, outcome),
            Err(e) => summary.failed.push(TenantFailure {
                tenant,
                error: format!("tenant task aborted: {}", e),
            }),
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pii_ingest_core::Salt;
    use std::path::Path;
    use tempfile::TempDir;

    #[test]
    fn test_parse_run_with_tenants() {
        let args = Args::parse_from(["pii-ingest", "run", "--tenant", "tenant1", "--tenant", "tenant4"]);
        match args.command {
            Command::Run { tenant } => assert_eq!(tenant, vec!["tenant1", "tenant4"]),
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_parse_anonymize() {
        let args = Args::parse_from([
            "pii-ingest",
            "--salt",
            "pepper",
            "anonymize",
            "tenant1",
            "--column",
            "user_id",
            "--column",
            "country",
            "--batch-size",
            "500",
            "--checkpoint",
        ]);

        assert_eq!(args.salt.as_deref(), Some("pepper"));
        match args.command {
            Command::Anonymize {
                table,
                columns,
                batch_size,
                pk_column,
                checkpoint,
            } => {
                assert_eq!(table, "tenant1");
                assert_eq!(columns, vec!["user_id", "country"]);
                assert_eq!(batch_size, Some(500));
                assert_eq!(pk_column, None);
                assert!(checkpoint);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_anonymize_requires_column() {
        assert!(Args::try_parse_from(["pii-ingest", "anonymize", "tenant1"]).is_err());
    }

    #[test]
    fn test_negative_batch_size_rejected() {
        assert!(Args::try_parse_from([
            "pii-ingest",
            "anonymize",
            "tenant1",
            "--column",
            "user_id",
            "--batch-size",
            "-5",
        ])
        .is_err());
    }

    #[test]
    fn test_load_config_applies_salt_override() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("pii-ingest.toml");
        let mut config = Config::default();
        config.storage.database_path = temp_dir.path().join("sqlite.db");
        config.ingest.input_dir = temp_dir.path().join("raw_data");
        config.to_file(&config_path).unwrap();

        let args = Args::parse_from([
            "pii-ingest",
            "--config",
            config_path.to_str().unwrap(),
            "--salt",
            "pepper",
            "tables",
        ]);
        let loaded = args.load_config().unwrap();
        assert_eq!(loaded.salt().unwrap().as_str(), "pepper");
    }

    #[tokio::test]
    async fn test_run_tenants_collects_results() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.database_path = temp_dir.path().join("sqlite.db");
        config.ingest.input_dir = temp_dir.path().to_path_buf();
        std::fs::write(
            temp_dir.path().join("tenant1.csv"),
            "id,user_id,event_time,value,country\n1,alice,2025-06-16T08:00:00,1.0,DE\n",
        )
        .unwrap();

        let pipeline = Arc::new(TenantPipeline::new(&config, Salt::new("shuru").unwrap()));
        let summary = run_tenants(
            pipeline,
            vec!["tenant1".to_string(), "missing".to_string()],
            2,
        )
        .await
        .unwrap();

        assert_eq!(summary.succeeded.len(), 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].tenant, "missing");
        assert!(Path::new(&config.storage.database_path).exists());
    }
}
