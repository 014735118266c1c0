//! FlavorCraft Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging and report formatting for the FlavorCraft
//! workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`LoadError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Formatting**: human-readable sizes, counts and rates for progress output
//!
//! # Example
//!
//! ```no_run
//! use flavorcraft_common::format::{human_bytes, thousands};
//!
//! assert_eq!(thousands(25_000), "25,000");
//! println!("{}", human_bytes(3 * 1024 * 1024));
//! ```

pub mod error;
pub mod format;
pub mod logging;

// Re-export commonly used types
pub use error::{truncate_error, LoadError, Result};
