//! Loader configuration
//!
//! One [`LoaderConfig`] is built per run and handed to the orchestrator and
//! transfer engine; nothing is read from global state after startup.

use std::path::PathBuf;

use crate::db::{DbConfig, DEFAULT_PAGE_SIZE};

// ============================================================================
// Load Configuration Constants
// ============================================================================

/// Source rows per batch (and per connection).
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Rows between progress log lines.
pub const DEFAULT_LOG_INTERVAL: u64 = 100_000;

pub const DEFAULT_DATA_DIR: &str = "./data";

pub const DEFAULT_SCHEMA_PATH: &str = "./database/schema.sql";

/// Columns that hold booleans encoded as 0/1, "t"/"f", "True"/"False".
pub const DEFAULT_BOOLEAN_COLUMNS: &[&str] = &[
    "demo_mode",
    "trainee_mode",
    "requires_signature",
    "synchronized_to_accounting",
    "mobile_phone_valid",
    "email_valid",
];

/// Batch transfer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub batch_size: usize,
    pub page_size: usize,
    pub log_interval: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            log_interval: DEFAULT_LOG_INTERVAL,
        }
    }
}

/// Everything one load run needs
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub database: DbConfig,
    pub transfer: TransferSettings,
    pub data_dir: PathBuf,
    pub schema_path: PathBuf,
    /// JSON catalogue; the built-in FlavorCraft layout is used when unset
    pub catalogue_path: Option<PathBuf>,
    pub boolean_columns: Vec<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            database: DbConfig::default(),
            transfer: TransferSettings::default(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            schema_path: PathBuf::from(DEFAULT_SCHEMA_PATH),
            catalogue_path: None,
            boolean_columns: DEFAULT_BOOLEAN_COLUMNS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl LoaderConfig {
    /// Load configuration from `.env` and the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_env_with(DbConfig::from_env()?)
    }

    /// Load everything except the connection descriptor, which is supplied.
    /// Used for dry runs that never touch the database.
    pub fn from_env_with(database: DbConfig) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());

        let config = Self {
            database,
            transfer: TransferSettings {
                batch_size: parse_or(
                    env("LOAD_BATCH_SIZE"),
                    "LOAD_BATCH_SIZE",
                    DEFAULT_BATCH_SIZE,
                )?,
                page_size: parse_or(env("LOAD_PAGE_SIZE"), "LOAD_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
                log_interval: parse_or(
                    env("LOAD_LOG_INTERVAL"),
                    "LOAD_LOG_INTERVAL",
                    DEFAULT_LOG_INTERVAL,
                )?,
            },
            data_dir: env("LOAD_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            schema_path: env("LOAD_SCHEMA_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.schema_path),
            catalogue_path: env("LOAD_CATALOGUE").map(PathBuf::from),
            boolean_columns: env("LOAD_BOOLEAN_COLUMNS")
                .map(|list| {
                    list.split(',')
                        .map(|c| c.trim().to_string())
                        .filter(|c| !c.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.boolean_columns),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.transfer.batch_size == 0 {
            anyhow::bail!("LOAD_BATCH_SIZE must be greater than 0");
        }
        if self.transfer.page_size == 0 {
            anyhow::bail!("LOAD_PAGE_SIZE must be greater than 0");
        }
        if self.transfer.log_interval == 0 {
            anyhow::bail!("LOAD_LOG_INTERVAL must be greater than 0");
        }
        Ok(())
    }
}

fn parse_or<T: std::str::FromStr>(
    value: Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T> {
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{key} must be a positive integer, got {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const LOAD_VARS: &[&str] = &[
        "LOAD_BATCH_SIZE",
        "LOAD_PAGE_SIZE",
        "LOAD_LOG_INTERVAL",
        "LOAD_DATA_DIR",
        "LOAD_SCHEMA_PATH",
        "LOAD_CATALOGUE",
        "LOAD_BOOLEAN_COLUMNS",
    ];

    fn clear_env() {
        for var in LOAD_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let config = LoaderConfig::default();
        assert_eq!(config.transfer.batch_size, 10_000);
        assert_eq!(config.transfer.page_size, 1_000);
        assert_eq!(config.transfer.log_interval, 100_000);
        assert_eq!(config.boolean_columns.len(), 6);
        assert!(config.catalogue_path.is_none());
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("LOAD_BATCH_SIZE", "5000");
        std::env::set_var("LOAD_DATA_DIR", "/srv/flavorcraft");
        std::env::set_var("LOAD_BOOLEAN_COLUMNS", "is_active, , is_deleted");

        let config = LoaderConfig::from_env_with(DbConfig::default()).unwrap();
        assert_eq!(config.transfer.batch_size, 5_000);
        assert_eq!(config.transfer.page_size, 1_000);
        assert_eq!(config.data_dir, PathBuf::from("/srv/flavorcraft"));
        assert_eq!(config.boolean_columns, vec!["is_active", "is_deleted"]);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_rejected() {
        clear_env();
        std::env::set_var("LOAD_BATCH_SIZE", "ten");
        assert!(LoaderConfig::from_env_with(DbConfig::default()).is_err());

        std::env::set_var("LOAD_BATCH_SIZE", "0");
        assert!(LoaderConfig::from_env_with(DbConfig::default()).is_err());
        clear_env();
    }
}
