//! Batch transfer engine
//!
//! Streams one source file into one table: read a batch, sanitize it, insert
//! it through a session opened for that batch alone, close the session, move
//! on. Batch failures are logged and skipped. Anything that stops the stream
//! itself ends the table load with whatever was committed so far.

use anyhow::Context;
use flavorcraft_common::format::{human_bytes, minutes, rows_per_sec, thousands};
use flavorcraft_common::truncate_error;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::catalogue::LoadTarget;
use crate::config::{LoaderConfig, TransferSettings};
use crate::db::Destination;
use crate::sanitize::RowSanitizer;
use crate::source::{SourceBatch, SourceReader};

/// What happened to one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Committed {
        index: usize,
        submitted: u64,
        inserted: u64,
    },
    /// Rolled back; contributes nothing to the total
    Failed { index: usize, error: String },
    /// Sanitized to zero rows, nothing sent
    Skipped { index: usize },
}

/// Result of loading one source file into one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableLoadOutcome {
    pub table: String,
    pub source: PathBuf,
    /// Rows in committed batches, including rows skipped on conflict
    pub rows_committed: u64,
    /// Rows that were new to the table
    pub rows_inserted: u64,
    pub batches_committed: usize,
    pub batches_failed: usize,
    pub batches_skipped: usize,
    pub elapsed: Duration,
    /// Set when the load stopped early
    pub error: Option<String>,
}

impl TableLoadOutcome {
    fn new(target: &LoadTarget, source: &Path) -> Self {
        Self {
            table: target.table.clone(),
            source: source.to_path_buf(),
            rows_committed: 0,
            rows_inserted: 0,
            batches_committed: 0,
            batches_failed: 0,
            batches_skipped: 0,
            elapsed: Duration::ZERO,
            error: None,
        }
    }

    /// Whether every batch of the file was read and committed.
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.batches_failed == 0
    }

    pub fn batches(&self) -> usize {
        self.batches_committed + self.batches_failed + self.batches_skipped
    }

    fn record(&mut self, batch: &BatchOutcome) {
        match batch {
            BatchOutcome::Committed {
                submitted, inserted, ..
            } => {
                self.rows_committed += submitted;
                self.rows_inserted += inserted;
                self.batches_committed += 1;
            },
            BatchOutcome::Failed { .. } => self.batches_failed += 1,
            BatchOutcome::Skipped { .. } => self.batches_skipped += 1,
        }
    }
}

/// Logs throughput each time the running total crosses an interval boundary
#[derive(Debug)]
struct ProgressTracker {
    interval: u64,
    started: Instant,
    next_mark: u64,
}

impl ProgressTracker {
    fn new(interval: u64, started: Instant) -> Self {
        let interval = interval.max(1);
        Self {
            interval,
            started,
            next_mark: interval,
        }
    }

    /// Returns true if a progress line was due for `total`.
    fn record(&mut self, total: u64) -> bool {
        if total < self.next_mark {
            return false;
        }
        self.next_mark = (total / self.interval + 1) * self.interval;

        let rate = rows_per_sec(total, self.started.elapsed());
        info!(
            rows = total,
            rows_per_sec = rate.round() as u64,
            "{} rows | {:.0} rows/sec",
            thousands(total),
            rate
        );
        true
    }
}

/// Loads source files into tables, one batch and one session at a time
pub struct TransferEngine<'a> {
    destination: &'a dyn Destination,
    sanitizer: RowSanitizer,
    settings: TransferSettings,
}

impl<'a> TransferEngine<'a> {
    pub fn new(
        destination: &'a dyn Destination,
        sanitizer: RowSanitizer,
        settings: TransferSettings,
    ) -> Self {
        Self {
            destination,
            sanitizer,
            settings,
        }
    }

    pub fn from_config(destination: &'a dyn Destination, config: &LoaderConfig) -> Self {
        Self::new(
            destination,
            RowSanitizer::new(config.boolean_columns.iter().cloned()),
            config.transfer,
        )
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Load `source` into `target`.
    ///
    /// Never fails: a file-level error is logged and reported in the outcome
    /// together with the rows committed before it happened.
    pub async fn load_table(
        &self,
        source: &Path,
        target: &LoadTarget,
        log_interval: Option<u64>,
    ) -> TableLoadOutcome {
        let span = info_span!("load_table", table = %target.table);
        self.load_table_inner(source, target, log_interval.unwrap_or(self.settings.log_interval))
            .instrument(span)
            .await
    }

    async fn load_table_inner(
        &self,
        source: &Path,
        target: &LoadTarget,
        log_interval: u64,
    ) -> TableLoadOutcome {
        let started = Instant::now();
        let mut outcome = TableLoadOutcome::new(target, source);

        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.display().to_string());
        let size = tokio::fs::metadata(source)
            .await
            .map(|m| human_bytes(m.len()))
            .unwrap_or_else(|_| "unknown size".to_string());
        info!(table = %target.table, file = %file_name, size = %size, "Loading {}", target.table);

        let mut progress = ProgressTracker::new(log_interval, started);
        let result = self.stream(source, target, &mut outcome, &mut progress).await;
        outcome.elapsed = started.elapsed();

        match result {
            Ok(()) => {
                info!(
                    rows = outcome.rows_committed,
                    inserted = outcome.rows_inserted,
                    batches = outcome.batches(),
                    failed_batches = outcome.batches_failed,
                    "{} done: {} rows in {}",
                    target.table,
                    thousands(outcome.rows_committed),
                    minutes(outcome.elapsed)
                );
            },
            Err(e) => {
                let detail = format!("{e:#}");
                error!(
                    rows = outcome.rows_committed,
                    error = %detail,
                    "{} failed after {} rows",
                    target.table,
                    thousands(outcome.rows_committed)
                );
                outcome.error = Some(detail);
            },
        }

        outcome
    }

    async fn stream(
        &self,
        source: &Path,
        target: &LoadTarget,
        outcome: &mut TableLoadOutcome,
        progress: &mut ProgressTracker,
    ) -> anyhow::Result<()> {
        let mut reader = SourceReader::open(source)
            .await
            .with_context(|| format!("Failed to open {}", source.display()))?;
        target.check_header(reader.headers())?;

        while let Some(batch) = reader
            .next_batch(self.settings.batch_size)
            .await
            .with_context(|| format!("Failed to read {}", source.display()))?
        {
            let result = self.transfer_batch(target, &batch).await?;
            outcome.record(&result);
            if let BatchOutcome::Committed { .. } = result {
                progress.record(outcome.rows_committed);
            }
        }

        Ok(())
    }

    /// Sanitize and insert one batch through a session of its own.
    ///
    /// Insert errors become [`BatchOutcome::Failed`]; only failing to open a
    /// session is returned as an error, since no later batch could do better.
    pub async fn transfer_batch(
        &self,
        target: &LoadTarget,
        batch: &SourceBatch,
    ) -> anyhow::Result<BatchOutcome> {
        let index = batch.index;
        let mut session = self
            .destination
            .open_session()
            .await
            .context("Failed to open load session")?;

        let sanitized = self.sanitizer.sanitize(batch);
        let result = if sanitized.is_empty() {
            None
        } else {
            Some(
                session
                    .insert_batch(target, &sanitized, self.settings.page_size)
                    .await,
            )
        };

        if let Err(e) = session.close().await {
            warn!(batch = index, error = %e, "Failed to close load session");
        }

        Ok(match result {
            None => {
                debug!(batch = index, "Empty batch skipped");
                BatchOutcome::Skipped { index }
            },
            Some(Ok(insert)) => {
                debug!(
                    batch = index,
                    submitted = insert.submitted,
                    inserted = insert.inserted,
                    "Batch committed"
                );
                BatchOutcome::Committed {
                    index,
                    submitted: insert.submitted,
                    inserted: insert.inserted,
                }
            },
            Some(Err(e)) => {
                let summary = truncate_error(&e.summary());
                warn!(batch = index, error = %summary, "Batch {} error: {}", index, summary);
                BatchOutcome::Failed {
                    index,
                    error: summary,
                }
            },
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::db::MemoryDestination;
    use crate::source::SourceColumn;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn csv_rows(range: std::ops::Range<u64>) -> String {
        let mut csv = String::from("id,name,amount,demo_mode\n");
        for id in range {
            csv.push_str(&format!("{id},item {id},{}.0,{}\n", id % 50, id % 2));
        }
        csv
    }

    fn csv_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn settings(batch_size: usize) -> TransferSettings {
        TransferSettings {
            batch_size,
            ..TransferSettings::default()
        }
    }

    fn engine(dest: &MemoryDestination, batch_size: usize) -> TransferEngine<'_> {
        TransferEngine::new(dest, RowSanitizer::new(["demo_mode"]), settings(batch_size))
    }

    #[tokio::test]
    async fn test_loads_file_in_batches() {
        let file = csv_file(&csv_rows(0..25_000));
        let dest = MemoryDestination::new().with_tables(["fct_payments"]);

        let outcome = engine(&dest, 10_000)
            .load_table(file.path(), &LoadTarget::new("fct_payments"), None)
            .await;

        assert_eq!(outcome.rows_committed, 25_000);
        assert_eq!(outcome.rows_inserted, 25_000);
        assert_eq!(outcome.batches_committed, 3);
        assert!(outcome.is_complete());
        assert_eq!(dest.rows_in("fct_payments"), Some(25_000));
    }

    #[tokio::test]
    async fn test_one_session_per_batch() {
        let file = csv_file(&csv_rows(0..25_000));
        let dest = MemoryDestination::new().with_tables(["fct_payments"]);

        engine(&dest, 10_000)
            .load_table(file.path(), &LoadTarget::new("fct_payments"), None)
            .await;

        let stats = dest.session_stats();
        assert_eq!(stats.opened, 3);
        assert_eq!(stats.closed, 3);
        assert_eq!(stats.max_open, 1);
        assert_eq!(stats.open_now(), 0);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let file = csv_file(&csv_rows(0..2_500));
        let dest = MemoryDestination::new().with_tables(["dim_users"]);
        let engine = engine(&dest, 1_000);
        let target = LoadTarget::new("dim_users");

        let first = engine.load_table(file.path(), &target, None).await;
        let second = engine.load_table(file.path(), &target, None).await;

        assert_eq!(first.rows_inserted, 2_500);
        assert_eq!(second.rows_committed, 2_500);
        assert_eq!(second.rows_inserted, 0);
        assert_eq!(dest.rows_in("dim_users"), Some(2_500));
    }

    #[tokio::test]
    async fn test_resume_after_interruption() {
        let partial = csv_file(&csv_rows(0..10_000));
        let full = csv_file(&csv_rows(0..25_000));
        let dest = MemoryDestination::new().with_tables(["fct_payments"]);
        let engine = engine(&dest, 10_000);
        let target = LoadTarget::new("fct_payments");

        engine.load_table(partial.path(), &target, None).await;
        let resumed = engine.load_table(full.path(), &target, None).await;

        assert_eq!(resumed.rows_inserted, 15_000);
        assert_eq!(dest.rows_in("fct_payments"), Some(25_000));
    }

    #[tokio::test]
    async fn test_failed_batch_contributes_nothing() {
        let file = csv_file(&csv_rows(0..25_000));
        let dest = MemoryDestination::new().with_tables(["fct_payments"]);
        dest.reject_key("fct_payments", "12345");

        let outcome = engine(&dest, 10_000)
            .load_table(file.path(), &LoadTarget::new("fct_payments"), None)
            .await;

        assert_eq!(outcome.rows_committed, 15_000);
        assert_eq!(outcome.batches_committed, 2);
        assert_eq!(outcome.batches_failed, 1);
        assert!(outcome.error.is_none());
        assert!(!outcome.is_complete());
        assert_eq!(dest.rows_in("fct_payments"), Some(15_000));
        assert_eq!(dest.session_stats().opened, 3);
    }

    #[tokio::test]
    async fn test_missing_file_is_table_error() {
        let dest = MemoryDestination::new().with_tables(["dim_users"]);

        let outcome = engine(&dest, 10_000)
            .load_table(
                Path::new("/nonexistent/dim_users.csv"),
                &LoadTarget::new("dim_users"),
                None,
            )
            .await;

        assert_eq!(outcome.rows_committed, 0);
        assert!(outcome.error.is_some());
        assert_eq!(dest.session_stats().opened, 0);
    }

    #[tokio::test]
    async fn test_malformed_row_returns_partial_count() {
        let mut csv = csv_rows(0..15_000);
        csv.push_str("15000,too,many,fields,here\n");
        csv.push_str(&csv_rows(15_001..16_000).replace("id,name,amount,demo_mode\n", ""));
        let file = csv_file(&csv);
        let dest = MemoryDestination::new().with_tables(["fct_payments"]);

        let outcome = engine(&dest, 10_000)
            .load_table(file.path(), &LoadTarget::new("fct_payments"), None)
            .await;

        assert_eq!(outcome.rows_committed, 10_000);
        assert!(outcome.error.is_some());
        assert_eq!(dest.rows_in("fct_payments"), Some(10_000));
        assert_eq!(dest.session_stats().open_now(), 0);
    }

    #[tokio::test]
    async fn test_header_mismatch_is_table_error() {
        let file = csv_file(&csv_rows(0..10));
        let dest = MemoryDestination::new().with_tables(["dim_users"]);
        let target = LoadTarget::new("dim_users").with_columns(["id", "email"]);

        let outcome = engine(&dest, 10_000).load_table(file.path(), &target, None).await;

        assert_eq!(outcome.rows_committed, 0);
        assert!(outcome.error.unwrap().contains("Header mismatch"));
        assert_eq!(dest.rows_in("dim_users"), Some(0));
    }

    #[tokio::test]
    async fn test_unknown_table_fails_every_batch() {
        let file = csv_file(&csv_rows(0..30));
        let dest = MemoryDestination::new();

        let outcome = engine(&dest, 10)
            .load_table(file.path(), &LoadTarget::new("missing"), None)
            .await;

        assert_eq!(outcome.rows_committed, 0);
        assert_eq!(outcome.batches_failed, 3);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_store_message() {
        let dest = MemoryDestination::new().with_tables(["fct_payments"]);
        dest.reject_key("fct_payments", "7");
        let batch = SourceBatch::new(4, vec![SourceColumn::from_fields("id", &["6", "7", "8"])]);

        let outcome = engine(&dest, 10)
            .transfer_batch(&LoadTarget::new("fct_payments"), &batch)
            .await
            .unwrap();

        match outcome {
            BatchOutcome::Failed { index, error } => {
                assert_eq!(index, 4);
                assert!(error.starts_with("insert on table \"fct_payments\""), "{error}");
            },
            other => panic!("expected a failed batch, got {other:?}"),
        }
        assert_eq!(dest.rows_in("fct_payments"), Some(0));
    }

    #[test]
    fn test_progress_marks_crossed_boundaries() {
        let mut progress = ProgressTracker::new(100_000, Instant::now());

        assert!(!progress.record(60_000));
        assert!(progress.record(120_000));
        assert!(!progress.record(180_000));
        // Jumping past several marks logs once
        assert!(progress.record(420_000));
        assert!(progress.record(500_000));
        assert!(!progress.record(510_000));
    }
}
