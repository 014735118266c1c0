//! PostgreSQL destination
//!
//! The pool holds at most one connection and evicts it after `max_lifetime`,
//! so no connection survives past the store's session limit even when
//! reconnect-every-batch is turned off.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::{
    page_rows, quote_ident, BatchInsert, DbConfig, DbError, DbResult, Destination, LoadSession,
};
use crate::catalogue::LoadTarget;
use crate::sanitize::{SanitizedBatch, SqlValue};
use crate::status::{RowCount, StatusReport, TableStatus};

/// Column name -> declared type (without modifiers), per table
type ColumnTypes = HashMap<String, String>;
type TypeCache = Arc<Mutex<HashMap<String, Arc<ColumnTypes>>>>;

pub struct PgDestination {
    pool: PgPool,
    reconnect_every_batch: bool,
    column_types: TypeCache,
}

impl PgDestination {
    /// Build the destination. No connection is opened until the first
    /// session or status query.
    pub fn connect_lazy(config: &DbConfig) -> DbResult<Self> {
        let options = config.connect_options()?;

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .min_connections(0)
            .acquire_timeout(config.connect_timeout())
            .max_lifetime(config.max_lifetime())
            .test_before_acquire(true)
            .connect_lazy_with(options);

        info!(
            max_lifetime_secs = config.max_lifetime_secs,
            reconnect_every_batch = config.reconnect_every_batch,
            "Database destination configured"
        );

        Ok(Self::from_pool(pool, config.reconnect_every_batch))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, reconnect_every_batch: bool) -> Self {
        Self {
            pool,
            reconnect_every_batch,
            column_types: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Destination for PgDestination {
    async fn open_session(&self) -> DbResult<Box<dyn LoadSession>> {
        let conn = self.pool.acquire().await?;
        debug!("Load session opened");
        Ok(Box::new(PgSession {
            conn: Some(conn),
            reconnect: self.reconnect_every_batch,
            column_types: Arc::clone(&self.column_types),
        }))
    }

    async fn table_row_counts(&self) -> DbResult<StatusReport> {
        let mut conn = self.pool.acquire().await?;

        let tables: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = 'public'
              AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        let mut statuses = Vec::with_capacity(tables.len());
        for table in tables {
            let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&table));
            let count = match sqlx::query_scalar::<_, i64>(&sql).fetch_one(&mut *conn).await {
                Ok(rows) => RowCount::Rows(rows.max(0) as u64),
                Err(e) => {
                    warn!(table = %table, error = %e, "Failed to count rows");
                    RowCount::Error(e.to_string())
                },
            };
            statuses.push(TableStatus { table, count });
        }

        Ok(StatusReport::new(statuses))
    }

    async fn apply_schema(&self, ddl: &str) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(ddl)).await?;
        tx.commit().await?;
        self.column_types
            .lock()
            .map_err(|_| DbError::Rejected("column type cache poisoned".into()))?
            .clear();
        Ok(())
    }

    async fn shutdown(&self) {
        self.pool.close().await;
    }
}

/// One pooled connection, held for one batch
struct PgSession {
    conn: Option<PoolConnection<Postgres>>,
    reconnect: bool,
    column_types: TypeCache,
}

impl PgSession {
    fn cached_types(&self, table: &str) -> Option<Arc<ColumnTypes>> {
        self.column_types
            .lock()
            .ok()
            .and_then(|cache| cache.get(table).cloned())
    }

    fn cache_types(&self, table: &str, types: Arc<ColumnTypes>) {
        if let Ok(mut cache) = self.column_types.lock() {
            cache.insert(table.to_string(), types);
        }
    }
}

#[async_trait]
impl LoadSession for PgSession {
    async fn insert_batch(
        &mut self,
        target: &LoadTarget,
        batch: &SanitizedBatch,
        page_size: usize,
    ) -> DbResult<BatchInsert> {
        if batch.is_empty() {
            return Ok(BatchInsert::default());
        }

        let types = match self.cached_types(&target.table) {
            Some(types) => types,
            None => {
                let conn = self.conn.as_mut().ok_or(DbError::SessionClosed)?;
                let types = Arc::new(fetch_column_types(conn, &target.table).await?);
                // A missing table has no columns; don't cache that
                if !types.is_empty() {
                    self.cache_types(&target.table, Arc::clone(&types));
                }
                types
            },
        };

        let conn = self.conn.as_mut().ok_or(DbError::SessionClosed)?;
        let mut tx = conn.begin().await?;

        match write_pages(&mut tx, target, batch, &types, page_size).await {
            Ok(inserted) => {
                tx.commit().await?;
                Ok(BatchInsert {
                    submitted: batch.len() as u64,
                    inserted,
                })
            },
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            },
        }
    }

    async fn close(&mut self) -> DbResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        if self.reconnect {
            conn.close().await?;
        } else {
            drop(conn);
        }
        debug!("Load session closed");
        Ok(())
    }
}

async fn fetch_column_types(conn: &mut PgConnection, table: &str) -> DbResult<ColumnTypes> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT a.attname::text, format_type(a.atttypid, NULL)
        FROM pg_attribute a
        WHERE a.attrelid = to_regclass($1)
          AND a.attnum > 0
          AND NOT a.attisdropped
        "#,
    )
    .bind(quote_ident(table))
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().collect())
}

/// Send the batch as `INSERT ... ON CONFLICT DO NOTHING` pages.
///
/// Values are bound as text and cast to the column's declared type, so the
/// server parses them exactly as it would literals.
async fn write_pages(
    conn: &mut PgConnection,
    target: &LoadTarget,
    batch: &SanitizedBatch,
    types: &ColumnTypes,
    page_size: usize,
) -> DbResult<u64> {
    let column_list = batch
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let casts: Vec<Option<String>> = batch
        .columns
        .iter()
        .map(|c| types.get(c).map(|t| format!("::{t}")))
        .collect();
    let page = page_rows(page_size, batch.columns.len());

    let mut inserted = 0;
    for rows in batch.rows.chunks(page) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            quote_ident(&target.table),
            column_list
        ));

        builder.push_values(rows, |mut b, row: &Vec<SqlValue>| {
            for (value, cast) in row.iter().zip(&casts) {
                b.push_bind(value.to_sql_text());
                if let Some(cast) = cast {
                    b.push_unseparated(cast);
                }
            }
        });

        builder.push(format!(
            " ON CONFLICT ({}) DO NOTHING",
            quote_ident(&target.conflict_key)
        ));

        let result = builder.build().execute(&mut *conn).await?;
        inserted += result.rows_affected();
    }

    Ok(inserted)
}
