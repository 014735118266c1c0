//! Shared helpers for loader integration tests
//!
//! Each test gets its own PostgreSQL container, so tests never see each
//! other's rows.

#![allow(dead_code)]

use anyhow::{Context, Result};
use flavorcraft_loader::db::DbConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

/// Schema used by the integration tests
pub const TEST_SCHEMA: &str = r#"
-- Reference data
CREATE TABLE dim_users (
    id          BIGINT PRIMARY KEY,
    name        TEXT NOT NULL,
    demo_mode   BOOLEAN,
    balance     NUMERIC(12, 2)
);

CREATE TABLE fct_payments (
    id          BIGINT PRIMARY KEY,
    user_id     BIGINT REFERENCES dim_users (id),
    amount      NUMERIC(12, 2),
    external_id BIGINT,
    demo_mode   BOOLEAN
);
"#;

/// PostgreSQL test container
pub struct TestPostgres {
    container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    /// Start an empty PostgreSQL container.
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self {
            container,
            pool,
            connection_string,
        })
    }

    /// Start a container with [`TEST_SCHEMA`] applied.
    pub async fn with_schema() -> Result<Self> {
        let pg = Self::start().await?;
        sqlx::raw_sql(TEST_SCHEMA)
            .execute(&pg.pool)
            .await
            .context("Failed to apply test schema")?;
        Ok(pg)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn db_config(&self) -> DbConfig {
        DbConfig {
            url: Some(self.connection_string.clone()),
            ..DbConfig::default()
        }
    }

    pub async fn count(&self, table: &str) -> Result<i64> {
        let count = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to count {table}"))?;
        Ok(count)
    }
}

/// Write a CSV file with `header` and one line per row.
pub fn write_csv(
    dir: &Path,
    name: &str,
    header: &str,
    rows: impl IntoIterator<Item = String>,
) -> PathBuf {
    let path = dir.join(name);
    let mut contents = format!("{header}\n");
    for row in rows {
        contents.push_str(&row);
        contents.push('\n');
    }
    std::fs::write(&path, contents).unwrap_or_else(|e| panic!("write {}: {e}", path.display()));
    path
}

/// `dim_users` rows for ids in `range`.
pub fn user_rows(range: std::ops::Range<i64>) -> impl Iterator<Item = String> {
    range.map(|id| {
        let demo = if id % 2 == 0 { "1.0" } else { "False" };
        format!("{id},user {id},{demo},{}.0", id % 100)
    })
}

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("flavorcraft_loader=debug,sqlx=warn")
        .with_test_writer()
        .try_init();
}
