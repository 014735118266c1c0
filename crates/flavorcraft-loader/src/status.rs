//! Destination status: per-table row counts and their text rendering

use flavorcraft_common::format::thousands;
use serde::Serialize;
use std::fmt::Write;

/// Row count of one table, or the reason it could not be counted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RowCount {
    Rows(u64),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStatus {
    pub table: String,
    pub count: RowCount,
}

/// Snapshot of the destination's tables, ordered by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub tables: Vec<TableStatus>,
}

impl StatusReport {
    pub fn new(mut tables: Vec<TableStatus>) -> Self {
        tables.sort_by(|a, b| a.table.cmp(&b.table));
        Self { tables }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Tables whose rows could be counted.
    pub fn accessible_count(&self) -> usize {
        self.counted().count()
    }

    /// Sum over every table that could be counted.
    pub fn total_rows(&self) -> u64 {
        self.counted().map(|(_, rows)| rows).sum()
    }

    pub fn rows_in(&self, table: &str) -> Option<u64> {
        self.counted().find(|(t, _)| *t == table).map(|(_, rows)| rows)
    }

    /// The `n` largest tables, descending by rows, ties by name.
    pub fn largest(&self, n: usize) -> Vec<(&str, u64)> {
        let mut counted: Vec<_> = self.counted().collect();
        counted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        counted.truncate(n);
        counted
    }

    fn counted(&self) -> impl Iterator<Item = (&str, u64)> {
        self.tables.iter().filter_map(|t| match t.count {
            RowCount::Rows(rows) => Some((t.table.as_str(), rows)),
            RowCount::Error(_) => None,
        })
    }

    /// Fixed-width "Table / Rows" listing.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Total tables: {}\n", self.table_count());
        let _ = writeln!(out, "{:<40} {:>15}", "Table", "Rows");
        let _ = writeln!(out, "{}", "-".repeat(60));
        for table in &self.tables {
            let rows = match &table.count {
                RowCount::Rows(rows) => thousands(*rows),
                RowCount::Error(_) => "ERROR".to_string(),
            };
            let _ = writeln!(out, "{:<40} {:>15}", table.table, rows);
        }
        out
    }
}
