//! Destination store abstraction
//!
//! A [`Destination`] hands out [`LoadSession`]s, one per batch. Sessions are
//! never shared and never outlive the batch they were opened for, which keeps
//! any single connection well inside the store's session time limit.

mod memory;
mod postgres;

pub use memory::{declared_tables, MemoryDestination, SessionStats};
pub use postgres::PgDestination;

use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::catalogue::LoadTarget;
use crate::sanitize::SanitizedBatch;
use crate::status::StatusReport;

/// PostgreSQL's limit on bind parameters in a single statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Default rows per INSERT statement within a batch.
pub const DEFAULT_PAGE_SIZE: usize = 1_000;

/// Default connection lifetime, kept under the destination's 45 minute cap.
pub const DEFAULT_MAX_LIFETIME_SECS: u64 = 2_400;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_DB_PORT: u16 = 5432;

/// Database operation errors
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Database configuration error: {0}. Check DATABASE_URL or DB_HOST/DB_NAME.")]
    Config(String),

    /// Rejected by the store (constraint, unknown relation, bad value)
    #[error("{0}")]
    Rejected(String),

    #[error("Load session already closed")]
    SessionClosed,
}

impl DbError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// The store's own message, without wrapper prefixes.
    pub fn summary(&self) -> String {
        match self {
            Self::Sqlx(e) => match e.as_database_error() {
                Some(db) => db.message().to_string(),
                None => e.to_string(),
            },
            Self::Rejected(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Result of inserting one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchInsert {
    /// Rows sent to the store
    pub submitted: u64,
    /// Rows that were new; the rest hit the conflict key
    pub inserted: u64,
}

/// A connection scoped to a single batch
#[async_trait]
pub trait LoadSession: Send {
    /// Insert every row of `batch` in one transaction, `page_size` rows per
    /// statement, skipping rows whose conflict key already exists. On error
    /// the whole batch is rolled back.
    async fn insert_batch(
        &mut self,
        target: &LoadTarget,
        batch: &SanitizedBatch,
        page_size: usize,
    ) -> DbResult<BatchInsert>;

    /// Release the connection. Idempotent.
    async fn close(&mut self) -> DbResult<()>;
}

/// The relational store rows are loaded into
#[async_trait]
pub trait Destination: Send + Sync {
    async fn open_session(&self) -> DbResult<Box<dyn LoadSession>>;

    /// Base tables of the public schema with their row counts.
    async fn table_row_counts(&self) -> DbResult<StatusReport>;

    /// Execute a DDL script verbatim, atomically.
    async fn apply_schema(&self, ddl: &str) -> DbResult<()>;

    /// Close any pooled connections at the end of a run.
    async fn shutdown(&self) {}
}

/// Connection descriptor and lifecycle settings
#[derive(Clone)]
pub struct DbConfig {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    /// Close the physical connection after every batch instead of returning
    /// it to the pool
    pub reconnect_every_batch: bool,
}

impl std::fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("max_lifetime_secs", &self.max_lifetime_secs)
            .field("reconnect_every_batch", &self.reconnect_every_batch)
            .finish()
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: None,
            port: DEFAULT_DB_PORT,
            database: None,
            user: None,
            password: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            max_lifetime_secs: DEFAULT_MAX_LIFETIME_SECS,
            reconnect_every_batch: true,
        }
    }
}

impl DbConfig {
    /// Read `DATABASE_URL`, or `DB_HOST`, `DB_PORT`, `DB_NAME`, `DB_USER`,
    /// `DB_PASSWORD`, plus `DB_CONNECT_TIMEOUT`, `DB_MAX_LIFETIME` and
    /// `LOAD_RECONNECT_EVERY_BATCH`.
    pub fn from_env() -> DbResult<Self> {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());

        let port = match env("DB_PORT") {
            Some(port) => port
                .parse()
                .map_err(|_| DbError::config(format!("DB_PORT is not a port number: {port}")))?,
            None => DEFAULT_DB_PORT,
        };

        let config = Self {
            url: env("DATABASE_URL"),
            host: env("DB_HOST"),
            port,
            database: env("DB_NAME"),
            user: env("DB_USER"),
            password: env("DB_PASSWORD"),
            connect_timeout_secs: env("DB_CONNECT_TIMEOUT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_lifetime_secs: env("DB_MAX_LIFETIME")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_LIFETIME_SECS),
            reconnect_every_batch: env("LOAD_RECONNECT_EVERY_BATCH")
                .and_then(|s| s.parse().ok())
                .unwrap_or(true),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.url.is_none() && (self.host.is_none() || self.database.is_none()) {
            return Err(DbError::config(
                "no connection descriptor: set DATABASE_URL or DB_HOST and DB_NAME",
            ));
        }
        if self.max_lifetime_secs == 0 {
            return Err(DbError::config("DB_MAX_LIFETIME must be greater than 0"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    /// Build connection options. A URL wins over the individual parts.
    pub fn connect_options(&self) -> DbResult<PgConnectOptions> {
        if let Some(url) = &self.url {
            return Ok(PgConnectOptions::from_str(url)?);
        }

        let host = self
            .host
            .as_deref()
            .ok_or_else(|| DbError::config("DB_HOST not set"))?;
        let database = self
            .database
            .as_deref()
            .ok_or_else(|| DbError::config("DB_NAME not set"))?;

        let mut options = PgConnectOptions::new()
            .host(host)
            .port(self.port)
            .database(database);
        if let Some(user) = &self.user {
            options = options.username(user);
        }
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }
}

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Rows per statement: the requested page size, capped so a statement never
/// exceeds the bind parameter limit.
pub fn page_rows(page_size: usize, column_count: usize) -> usize {
    let by_params = MAX_BIND_PARAMS / column_count.max(1);
    page_size.min(by_params).max(1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const DB_VARS: &[&str] = &[
        "DATABASE_URL",
        "DB_HOST",
        "DB_PORT",
        "DB_NAME",
        "DB_USER",
        "DB_PASSWORD",
        "DB_CONNECT_TIMEOUT",
        "DB_MAX_LIFETIME",
        "LOAD_RECONNECT_EVERY_BATCH",
    ];

    fn clear_env() {
        for var in DB_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("fct_payments"), "\"fct_payments\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_summary_strips_wrapper() {
        let rejected = DbError::Rejected("duplicate key value violates unique constraint".into());
        assert_eq!(rejected.summary(), "duplicate key value violates unique constraint");

        let timeout = DbError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(timeout.summary(), sqlx::Error::PoolTimedOut.to_string());
        assert!(!timeout.summary().starts_with("Database query failed"));

        assert_eq!(DbError::SessionClosed.summary(), "Load session already closed");
    }

    #[test]
    fn test_page_rows() {
        assert_eq!(page_rows(1_000, 12), 1_000);
        assert_eq!(page_rows(1_000, 100), 655);
        assert_eq!(page_rows(1_000, 0), 1_000);
        assert_eq!(page_rows(0, 5), 1);
    }

    #[test]
    #[serial]
    fn test_config_from_parts() {
        clear_env();
        std::env::set_var("DB_HOST", "db.example.com");
        std::env::set_var("DB_PORT", "6543");
        std::env::set_var("DB_NAME", "flavorcraft");
        std::env::set_var("DB_USER", "loader");
        std::env::set_var("DB_PASSWORD", "s3cret");

        let config = DbConfig::from_env().unwrap();
        assert_eq!(config.host.as_deref(), Some("db.example.com"));
        assert_eq!(config.port, 6543);
        assert_eq!(config.max_lifetime_secs, DEFAULT_MAX_LIFETIME_SECS);
        assert!(config.reconnect_every_batch);
        config.connect_options().unwrap();
        assert!(!format!("{:?}", config).contains("s3cret"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_from_url() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgresql://loader:pw@localhost:5432/flavorcraft");
        std::env::set_var("LOAD_RECONNECT_EVERY_BATCH", "false");

        let config = DbConfig::from_env().unwrap();
        assert!(!config.reconnect_every_batch);
        config.connect_options().unwrap();

        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_missing_descriptor() {
        clear_env();
        std::env::set_var("DB_HOST", "localhost");
        assert!(matches!(DbConfig::from_env(), Err(DbError::Config(_))));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_bad_port() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgresql://localhost/flavorcraft");
        std::env::set_var("DB_PORT", "not-a-port");
        assert!(matches!(DbConfig::from_env(), Err(DbError::Config(_))));
        clear_env();
    }
}
