//! In-process destination
//!
//! Backs `--dry-run`: batches go through the real sanitizer and session
//! lifecycle, and conflict keys are tracked so re-runs behave like the real
//! store, but nothing leaves the process. Tables exist once declared by a
//! schema script (`CREATE TABLE ...`) or by [`MemoryDestination::with_tables`].
//!
//! Keys registered with [`MemoryDestination::reject_key`] make any batch
//! containing them fail, the way a foreign key or check constraint would.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{BatchInsert, DbError, DbResult, Destination, LoadSession};
use crate::catalogue::LoadTarget;
use crate::sanitize::SanitizedBatch;
use crate::status::{RowCount, StatusReport, TableStatus};

/// Session lifecycle counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub opened: usize,
    pub closed: usize,
    /// Highest number of sessions open at the same time
    pub max_open: usize,
    open_now: usize,
}

impl SessionStats {
    pub fn open_now(&self) -> usize {
        self.open_now
    }
}

#[derive(Debug, Default)]
struct MemoryTable {
    keys: HashSet<String>,
    rows: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    rejected: HashMap<String, HashSet<String>>,
    status_unavailable: bool,
    schema_error: Option<String>,
    schemas_applied: usize,
    sessions: SessionStats,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare empty tables up front.
    pub fn with_tables<I, S>(self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut state = self.lock();
            for table in tables {
                state.tables.entry(table.into()).or_default();
            }
        }
        self
    }

    /// Make any batch carrying this conflict key value fail.
    pub fn reject_key(&self, table: &str, key: impl Into<String>) {
        self.lock()
            .rejected
            .entry(table.to_string())
            .or_default()
            .insert(key.into());
    }

    /// Make status queries fail, as if the store were unreachable.
    pub fn fail_status(&self) {
        self.lock().status_unavailable = true;
    }

    /// Make schema application fail with `message`.
    pub fn fail_schema(&self, message: impl Into<String>) {
        self.lock().schema_error = Some(message.into());
    }

    pub fn rows_in(&self, table: &str) -> Option<u64> {
        self.lock().tables.get(table).map(|t| t.rows)
    }

    pub fn session_stats(&self) -> SessionStats {
        self.lock().sessions
    }

    pub fn schemas_applied(&self) -> usize {
        self.lock().schemas_applied
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn open_session(&self) -> DbResult<Box<dyn LoadSession>> {
        {
            let mut state = self.lock();
            let sessions = &mut state.sessions;
            sessions.opened += 1;
            sessions.open_now += 1;
            sessions.max_open = sessions.max_open.max(sessions.open_now);
        }
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            open: true,
        }))
    }

    async fn table_row_counts(&self) -> DbResult<StatusReport> {
        let state = self.lock();
        if state.status_unavailable {
            return Err(DbError::Rejected("destination is not reachable".into()));
        }
        Ok(StatusReport::new(
            state
                .tables
                .iter()
                .map(|(name, table)| TableStatus {
                    table: name.clone(),
                    count: RowCount::Rows(table.rows),
                })
                .collect(),
        ))
    }

    async fn apply_schema(&self, ddl: &str) -> DbResult<()> {
        let mut state = self.lock();
        if let Some(message) = &state.schema_error {
            return Err(DbError::Rejected(message.clone()));
        }
        for table in declared_tables(ddl) {
            state.tables.entry(table).or_default();
        }
        state.schemas_applied += 1;
        Ok(())
    }
}

struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    open: bool,
}

impl MemorySession {
    fn release(&mut self) {
        if std::mem::take(&mut self.open) {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.sessions.closed += 1;
            state.sessions.open_now = state.sessions.open_now.saturating_sub(1);
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl LoadSession for MemorySession {
    async fn insert_batch(
        &mut self,
        target: &LoadTarget,
        batch: &SanitizedBatch,
        _page_size: usize,
    ) -> DbResult<BatchInsert> {
        if !self.open {
            return Err(DbError::SessionClosed);
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let MemoryState {
            tables, rejected, ..
        } = &mut *state;

        let table = tables.get_mut(&target.table).ok_or_else(|| {
            DbError::Rejected(format!("relation \"{}\" does not exist", target.table))
        })?;

        let key_idx = batch.columns.iter().position(|c| *c == target.conflict_key);
        let keys: Vec<Option<String>> = batch
            .rows
            .iter()
            .map(|row| key_idx.and_then(|i| row[i].to_sql_text()))
            .collect();

        // Validate before applying: a failed batch leaves no trace
        if let Some(blocked) = rejected.get(&target.table) {
            if let Some(key) = keys.iter().flatten().find(|k| blocked.contains(*k)) {
                return Err(DbError::Rejected(format!(
                    "insert on table \"{}\" violates constraint for {} = {}",
                    target.table, target.conflict_key, key
                )));
            }
        }

        let mut inserted = 0;
        for key in keys {
            let is_new = match key {
                Some(key) => table.keys.insert(key),
                None => true,
            };
            if is_new {
                inserted += 1;
            }
        }
        table.rows += inserted;

        Ok(BatchInsert {
            submitted: batch.len() as u64,
            inserted,
        })
    }

    async fn close(&mut self) -> DbResult<()> {
        self.release();
        Ok(())
    }
}

/// Table names declared by `CREATE TABLE` statements in a DDL script.
pub fn declared_tables(ddl: &str) -> Vec<String> {
    let without_comments: String = ddl
        .lines()
        .map(|line| line.split("--").next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n");

    let tokens: Vec<&str> = without_comments
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|t| !t.is_empty())
        .collect();

    let is = |i: usize, word: &str| tokens.get(i).is_some_and(|t| t.eq_ignore_ascii_case(word));

    let mut tables = Vec::new();
    for i in 0..tokens.len() {
        if !(is(i, "create") && is(i + 1, "table")) {
            continue;
        }
        let mut name_at = i + 2;
        if is(name_at, "if") && is(name_at + 1, "not") && is(name_at + 2, "exists") {
            name_at += 3;
        }
        if let Some(&name) = tokens.get(name_at) {
            let bare = name.rsplit('.').next().unwrap_or(name).trim_matches('"');
            if !bare.is_empty() && !tables.iter().any(|t| t == bare) {
                tables.push(bare.to_string());
            }
        }
    }
    tables
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sanitize::{SanitizedKind, SqlValue};

    fn batch(ids: &[i64]) -> SanitizedBatch {
        SanitizedBatch {
            index: 1,
            columns: vec!["id".into(), "name".into()],
            kinds: vec![SanitizedKind::Integer, SanitizedKind::Text],
            rows: ids
                .iter()
                .map(|id| vec![SqlValue::Integer(*id), SqlValue::Text(format!("row {id}"))])
                .collect(),
        }
    }

    #[test]
    fn test_declared_tables() {
        let ddl = r#"
            -- create table commented_out (id int);
            CREATE TABLE dim_users (id BIGINT PRIMARY KEY);
            create table if not exists public."fct_payments"(id bigint primary key);
            CREATE INDEX idx_payments ON fct_payments (id);
            CREATE TABLE dim_users (id BIGINT);
        "#;
        assert_eq!(declared_tables(ddl), vec!["dim_users", "fct_payments"]);
    }

    #[tokio::test]
    async fn test_conflicting_keys_are_skipped() {
        let dest = MemoryDestination::new().with_tables(["dim_users"]);
        let target = LoadTarget::new("dim_users");

        let mut session = dest.open_session().await.unwrap();
        let first = session.insert_batch(&target, &batch(&[1, 2, 3]), 1_000).await.unwrap();
        let second = session.insert_batch(&target, &batch(&[3, 4]), 1_000).await.unwrap();
        session.close().await.unwrap();

        assert_eq!(first, BatchInsert { submitted: 3, inserted: 3 });
        assert_eq!(second, BatchInsert { submitted: 2, inserted: 1 });
        assert_eq!(dest.rows_in("dim_users"), Some(4));
    }

    #[tokio::test]
    async fn test_rejected_key_fails_whole_batch() {
        let dest = MemoryDestination::new().with_tables(["fct_payments"]);
        dest.reject_key("fct_payments", "2");
        let target = LoadTarget::new("fct_payments");

        let mut session = dest.open_session().await.unwrap();
        let result = session.insert_batch(&target, &batch(&[1, 2, 3]), 1_000).await;

        assert!(matches!(result, Err(DbError::Rejected(_))));
        assert_eq!(dest.rows_in("fct_payments"), Some(0));
    }

    #[tokio::test]
    async fn test_unknown_table_rejected() {
        let dest = MemoryDestination::new();
        let mut session = dest.open_session().await.unwrap();
        let result = session
            .insert_batch(&LoadTarget::new("missing"), &batch(&[1]), 1_000)
            .await;
        assert!(matches!(result, Err(DbError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_session_stats_track_drop_and_close() {
        let dest = MemoryDestination::new();

        let mut first = dest.open_session().await.unwrap();
        first.close().await.unwrap();
        first.close().await.unwrap();
        drop(first);

        let second = dest.open_session().await.unwrap();
        assert_eq!(dest.session_stats().open_now(), 1);
        drop(second);

        let stats = dest.session_stats();
        assert_eq!(stats.opened, 2);
        assert_eq!(stats.closed, 2);
        assert_eq!(stats.max_open, 1);
        assert_eq!(stats.open_now(), 0);
    }

    #[tokio::test]
    async fn test_schema_and_status() {
        let dest = MemoryDestination::new();
        assert!(dest.table_row_counts().await.unwrap().is_empty());

        dest.apply_schema("CREATE TABLE dim_items (id BIGINT);").await.unwrap();
        let status = dest.table_row_counts().await.unwrap();
        assert_eq!(status.rows_in("dim_items"), Some(0));
        assert_eq!(dest.schemas_applied(), 1);

        dest.fail_status();
        assert!(dest.table_row_counts().await.is_err());
    }
}
