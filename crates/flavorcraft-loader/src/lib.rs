//! FlavorCraft Loader
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Chunked, resumable bulk loader for the FlavorCraft CSV exports.
//!
//! A run walks a [`catalogue::Catalogue`] of source files: dimension tables
//! first, then fact tables. Each file is streamed in fixed-size batches; every
//! batch is sanitized, inserted with `ON CONFLICT DO NOTHING` through a
//! connection opened for that batch only, and committed or rolled back on its
//! own. Re-running a load is always safe: rows already present are skipped.
//!
//! # Modules
//!
//! - [`source`]: streaming CSV reader with per-batch column typing
//! - [`sanitize`]: missing values, boolean coercion, whole-float narrowing
//! - [`db`]: the [`db::Destination`] trait, PostgreSQL and in-process backends
//! - [`transfer`]: per-table batch loop
//! - [`orchestrator`]: schema bootstrap, load phases, final summary
//! - [`status`]: per-table row counts
//!
//! # Example
//!
//! ```no_run
//! use flavorcraft_loader::{Catalogue, LoadOrchestrator, LoaderConfig, PgDestination};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = LoaderConfig::from_env()?;
//! let destination = PgDestination::connect_lazy(&config.database)?;
//! let catalogue = Catalogue::flavorcraft(&config.data_dir);
//!
//! let report = LoadOrchestrator::new(&config, &destination).run(&catalogue).await?;
//! println!("{} rows committed", report.rows_committed());
//! # Ok(())
//! # }
//! ```

pub mod catalogue;
pub mod config;
pub mod db;
pub mod orchestrator;
pub mod sanitize;
pub mod source;
pub mod status;
pub mod transfer;

pub use catalogue::{Catalogue, LoadTarget};
pub use config::LoaderConfig;
pub use db::{Destination, MemoryDestination, PgDestination};
pub use orchestrator::{LoadOrchestrator, RunReport};
pub use transfer::{TableLoadOutcome, TransferEngine};
