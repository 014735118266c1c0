//! FlavorCraft Loader - bulk CSV import into PostgreSQL

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flavorcraft_common::format::thousands;
use flavorcraft_common::logging::{init_logging, LogConfig, LogLevel};
use flavorcraft_loader::catalogue::DEFAULT_CONFLICT_KEY;
use flavorcraft_loader::db::DbConfig;
use flavorcraft_loader::orchestrator::apply_schema_file;
use flavorcraft_loader::{
    Catalogue, Destination, LoadOrchestrator, LoadTarget, LoaderConfig, MemoryDestination,
    PgDestination, TransferEngine,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "flavorcraft-loader")]
#[command(author, version, about = "Load the FlavorCraft CSV exports into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Directory holding the source CSV folders
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// DDL script applied when the database is empty
    #[arg(long, global = true)]
    schema: Option<PathBuf>,

    /// Source rows per batch
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Rows between progress lines
    #[arg(long, global = true)]
    log_interval: Option<u64>,

    /// Load into an in-process store instead of the database
    #[arg(long, global = true)]
    dry_run: bool,

    /// Print the run, table or status report as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Full load: schema bootstrap, dimension tables, fact tables (default)
    Load {
        /// JSON catalogue to use instead of the built-in layout
        #[arg(long)]
        catalogue: Option<PathBuf>,
    },

    /// Load a single CSV file into a single table
    Table {
        /// Source CSV file
        csv: PathBuf,

        /// Destination table
        table: String,

        /// Column whose duplicates are skipped
        #[arg(long, default_value = DEFAULT_CONFLICT_KEY)]
        conflict_key: String,
    },

    /// Print row counts for every table
    Status,

    /// Apply the DDL script
    Schema,
}

impl Cli {
    fn loader_config(&self) -> Result<LoaderConfig> {
        let mut config = if self.dry_run {
            dotenvy::dotenv().ok();
            LoaderConfig::from_env_with(DbConfig::default())?
        } else {
            LoaderConfig::from_env()?
        };

        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(schema) = &self.schema {
            config.schema_path = schema.clone();
        }
        if let Some(batch_size) = self.batch_size {
            config.transfer.batch_size = batch_size;
        }
        if let Some(interval) = self.log_interval {
            config.transfer.log_interval = interval;
        }
        if let Some(Command::Load {
            catalogue: Some(path),
        }) = &self.command
        {
            config.catalogue_path = Some(path.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over flags
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("flavorcraft-loader")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let config = cli.loader_config().context("Invalid configuration")?;

    let destination: Box<dyn Destination> = if cli.dry_run {
        info!("Dry run: loading into an in-process store");
        let memory = MemoryDestination::new();
        // Single-table loads have no DDL to declare the table
        match &cli.command {
            Some(Command::Table { table, .. }) => Box::new(memory.with_tables([table.clone()])),
            _ => Box::new(memory),
        }
    } else {
        Box::new(PgDestination::connect_lazy(&config.database)?)
    };

    let result = run(cli.command, cli.json, &config, destination.as_ref()).await;
    destination.shutdown().await;
    result
}

async fn run(
    command: Option<Command>,
    json: bool,
    config: &LoaderConfig,
    destination: &dyn Destination,
) -> Result<()> {
    match command.unwrap_or(Command::Load { catalogue: None }) {
        Command::Load { .. } => {
            let catalogue = match &config.catalogue_path {
                Some(path) => Catalogue::from_json_file(path, &config.data_dir)
                    .with_context(|| format!("Failed to read catalogue {}", path.display()))?,
                None => Catalogue::flavorcraft(&config.data_dir),
            };
            info!(
                dimensions = catalogue.dimensions.len(),
                facts = catalogue.facts.len(),
                sources = catalogue.source_count(),
                data_dir = %config.data_dir.display(),
                "Catalogue ready"
            );

            let report = LoadOrchestrator::new(config, destination).run(&catalogue).await?;
            info!(
                "Load complete: {} rows committed, {} new",
                thousands(report.rows_committed()),
                thousands(report.rows_inserted())
            );
            if json {
                print_json(&report)?;
            }
        },
        Command::Table {
            csv,
            table,
            conflict_key,
        } => {
            let target = LoadTarget::new(table).with_conflict_key(conflict_key);
            let engine = TransferEngine::from_config(destination, config);
            let outcome = engine.load_table(&csv, &target, None).await;
            if json {
                return print_json(&outcome);
            }
            println!(
                "{}: {} rows committed ({} new) in {} batches, {} failed",
                outcome.table,
                thousands(outcome.rows_committed),
                thousands(outcome.rows_inserted),
                outcome.batches(),
                outcome.batches_failed
            );
        },
        Command::Status => match destination.table_row_counts().await {
            Ok(status) if json => print_json(&status)?,
            Ok(status) => print!("{}", status.render_table()),
            Err(e) => error!(error = %e, "Failed to get table status"),
        },
        Command::Schema => {
            apply_schema_file(destination, &config.schema_path).await?;
        },
    }

    Ok(())
}

fn print_json<T: Serialize>(report: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    println!("{json}");
    Ok(())
}
