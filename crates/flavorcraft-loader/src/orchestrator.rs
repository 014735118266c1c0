//! Load orchestration
//!
//! One run: read the destination's status, create the schema if nothing is
//! there, load the dimension phase, load the fact phase, report. Only a
//! schema failure stops the run; everything else is logged and the run
//! moves on to the next table.

use anyhow::Context;
use chrono::{DateTime, Utc};
use flavorcraft_common::format::{minutes, thousands};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::catalogue::Catalogue;
use crate::config::LoaderConfig;
use crate::db::Destination;
use crate::status::StatusReport;
use crate::transfer::{TableLoadOutcome, TransferEngine};

/// Tables listed in the final summary.
pub const SUMMARY_TOP_TABLES: usize = 10;

/// A dimension source that was not present and therefore not loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSource {
    pub table: String,
    pub source: PathBuf,
}

/// Everything one run did
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub schema_created: bool,
    pub initial_status: StatusReport,
    pub dimensions: Vec<TableLoadOutcome>,
    pub facts: Vec<TableLoadOutcome>,
    pub skipped: Vec<SkippedSource>,
    pub final_status: StatusReport,
}

impl RunReport {
    pub fn loads(&self) -> impl Iterator<Item = &TableLoadOutcome> {
        self.dimensions.iter().chain(self.facts.iter())
    }

    /// Rows committed by this run, across every table load.
    pub fn rows_committed(&self) -> u64 {
        self.loads().map(|l| l.rows_committed).sum()
    }

    pub fn rows_inserted(&self) -> u64 {
        self.loads().map(|l| l.rows_inserted).sum()
    }

    pub fn batches_failed(&self) -> usize {
        self.loads().map(|l| l.batches_failed).sum()
    }

    /// Table loads that stopped on a file-level error.
    pub fn failed_loads(&self) -> Vec<&TableLoadOutcome> {
        self.loads().filter(|l| l.error.is_some()).collect()
    }

    /// The largest tables after the run.
    pub fn top_tables(&self) -> Vec<(&str, u64)> {
        self.final_status.largest(SUMMARY_TOP_TABLES)
    }
}

/// Sequences table loads over a catalogue
pub struct LoadOrchestrator<'a> {
    config: &'a LoaderConfig,
    destination: &'a dyn Destination,
}

impl<'a> LoadOrchestrator<'a> {
    pub fn new(config: &'a LoaderConfig, destination: &'a dyn Destination) -> Self {
        Self {
            config,
            destination,
        }
    }

    /// Run the whole load.
    ///
    /// # Errors
    ///
    /// Only when the destination is empty and the schema cannot be created.
    pub async fn run(&self, catalogue: &Catalogue) -> anyhow::Result<RunReport> {
        let started_at = Utc::now();
        let started = Instant::now();

        info!("{}", "=".repeat(70));
        info!("FlavorCraft database load");
        info!("{}", "=".repeat(70));

        let initial_status = self.current_status().await;
        // A status of nothing but unreadable tables counts as empty
        let schema_created = if initial_status.accessible_count() == 0 {
            info!("Database empty or not accessible, creating schema");
            self.create_schema().await?;
            true
        } else {
            info!(
                tables = initial_status.table_count(),
                rows = initial_status.total_rows(),
                "Current database: {} rows in {} tables",
                thousands(initial_status.total_rows()),
                initial_status.table_count()
            );
            false
        };

        let engine = TransferEngine::from_config(self.destination, self.config);

        info!("PHASE 1: Loading dimension tables");
        let mut dimensions = Vec::with_capacity(catalogue.dimensions.len());
        let mut skipped = Vec::new();
        for entry in &catalogue.dimensions {
            if !source_exists(&entry.source).await {
                warn!(
                    table = %entry.target.table,
                    source = %entry.source.display(),
                    "Source file not found, skipping {}",
                    entry.target.table
                );
                skipped.push(SkippedSource {
                    table: entry.target.table.clone(),
                    source: entry.source.clone(),
                });
                continue;
            }
            dimensions.push(
                engine
                    .load_table(&entry.source, &entry.target, entry.log_interval)
                    .await,
            );
        }

        info!("PHASE 2: Loading fact tables");
        let mut facts = Vec::new();
        for fact in &catalogue.facts {
            info!(
                table = %fact.target.table,
                files = fact.sources.len(),
                "{}",
                fact.target.table.to_uppercase()
            );
            for source in &fact.sources {
                facts.push(engine.load_table(source, &fact.target, fact.log_interval).await);
            }
        }

        let final_status = self.current_status().await;
        let report = RunReport {
            started_at,
            elapsed: started.elapsed(),
            schema_created,
            initial_status,
            dimensions,
            facts,
            skipped,
            final_status,
        };
        log_summary(&report);

        Ok(report)
    }

    /// Read the DDL script and apply it.
    pub async fn create_schema(&self) -> anyhow::Result<()> {
        apply_schema_file(self.destination, &self.config.schema_path).await
    }

    async fn current_status(&self) -> StatusReport {
        match self.destination.table_row_counts().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Failed to get table status");
                StatusReport::default()
            },
        }
    }
}

/// Apply the DDL script at `path` to `destination`.
pub async fn apply_schema_file(destination: &dyn Destination, path: &Path) -> anyhow::Result<()> {
    let ddl = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Schema file not found: {}", path.display()))?;

    info!(schema = %path.display(), "Creating database schema");
    destination
        .apply_schema(&ddl)
        .await
        .context("Schema creation failed")?;
    info!("Schema created successfully");
    Ok(())
}

async fn source_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn log_summary(report: &RunReport) {
    info!("{}", "=".repeat(70));
    info!("FINAL DATABASE STATUS");
    info!("{}", "=".repeat(70));

    let status = &report.final_status;
    if status.accessible_count() == 0 {
        warn!("Final table status unavailable");
    } else {
        info!(
            rows = status.total_rows(),
            tables = status.table_count(),
            "Total rows loaded: {}, tables populated: {}",
            thousands(status.total_rows()),
            status.table_count()
        );
        info!("Largest tables:");
        for (table, rows) in report.top_tables() {
            info!("  {}: {} rows", table, thousands(rows));
        }
    }

    let failed = report.failed_loads();
    info!(
        committed = report.rows_committed(),
        inserted = report.rows_inserted(),
        loads = report.dimensions.len() + report.facts.len(),
        skipped = report.skipped.len(),
        failed_loads = failed.len(),
        failed_batches = report.batches_failed(),
        "Run finished in {}",
        minutes(report.elapsed)
    );
    for load in failed {
        warn!(
            table = %load.table,
            source = %load.source.display(),
            rows = load.rows_committed,
            "Load stopped early"
        );
    }
}
