//! Load targets and the table catalogue
//!
//! The catalogue lists which source files feed which tables, split into the
//! dimension phase and the fact phase. Dimension tables are loaded first so
//! that fact rows find their referenced keys.

use flavorcraft_common::{LoadError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default conflict key column.
pub const DEFAULT_CONFLICT_KEY: &str = "id";

/// Progress interval used for dimension tables, which are small.
pub const DIMENSION_LOG_INTERVAL: u64 = 50_000;

/// A destination table and the columns it is populated with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadTarget {
    pub table: String,

    /// Expected source header, in order. Empty means "take the header as is".
    #[serde(default)]
    pub columns: Vec<String>,

    /// Column whose duplicates are skipped rather than rejected
    #[serde(default = "default_conflict_key")]
    pub conflict_key: String,
}

fn default_conflict_key() -> String {
    DEFAULT_CONFLICT_KEY.to_string()
}

impl LoadTarget {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            conflict_key: default_conflict_key(),
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_conflict_key(mut self, key: impl Into<String>) -> Self {
        self.conflict_key = key.into();
        self
    }

    /// Verify a source header against the declared column list.
    pub fn check_header(&self, header: &[String]) -> Result<()> {
        if self.columns.is_empty() || self.columns == header {
            return Ok(());
        }
        Err(LoadError::HeaderMismatch {
            table: self.table.clone(),
            expected: self.columns.join(", "),
            found: header.join(", "),
        })
    }
}

/// One source file loaded into one dimension table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogueEntry {
    pub source: PathBuf,
    pub target: LoadTarget,
    #[serde(default)]
    pub log_interval: Option<u64>,
}

/// A fact table, possibly split over several source files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactTable {
    pub target: LoadTarget,
    pub sources: Vec<PathBuf>,
    #[serde(default)]
    pub log_interval: Option<u64>,
}

/// Ordered load plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalogue {
    #[serde(default)]
    pub dimensions: Vec<CatalogueEntry>,
    #[serde(default)]
    pub facts: Vec<FactTable>,
}

impl Catalogue {
    /// The FlavorCraft dataset layout under `data_dir`.
    pub fn flavorcraft(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        let part1 = data_dir.join("Menu Engineering Part 1");
        let part2 = data_dir.join("Menu Engineering Part 2");
        let inventory = data_dir.join("Inventory Management");

        let dimensions = [
            "dim_users",
            "dim_menu_items",
            "dim_items",
            "dim_sections",
            "dim_add_ons",
            "dim_products",
            "dim_campaigns",
            "dim_taxonomy_terms",
        ]
        .into_iter()
        .map(|table| CatalogueEntry {
            source: part2.join(format!("{table}.csv")),
            target: LoadTarget::new(table),
            log_interval: Some(DIMENSION_LOG_INTERVAL),
        })
        .collect();

        let facts = vec![
            FactTable {
                target: LoadTarget::new("fct_payments"),
                sources: vec![
                    part1.join("fct_payments_part1.csv"),
                    part2.join("fct_payments_part2.csv"),
                ],
                log_interval: None,
            },
            FactTable {
                target: LoadTarget::new("fct_app_events"),
                sources: vec![part2.join("fct_app_events.csv")],
                log_interval: None,
            },
            FactTable {
                target: LoadTarget::new("fct_order_items"),
                sources: vec![inventory.join("fct_order_items.csv")],
                log_interval: None,
            },
        ];

        Self { dimensions, facts }
    }

    /// Read a JSON catalogue. Relative source paths resolve against `data_dir`.
    pub fn from_json_file(path: impl AsRef<Path>, data_dir: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents, data_dir)
    }

    pub fn from_json_str(json: &str, data_dir: impl AsRef<Path>) -> Result<Self> {
        let mut catalogue: Catalogue = serde_json::from_str(json)?;
        catalogue.resolve_sources(data_dir.as_ref());
        catalogue.validate()?;
        Ok(catalogue)
    }

    fn resolve_sources(&mut self, data_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = data_dir.join(&*p);
            }
        };
        for entry in &mut self.dimensions {
            resolve(&mut entry.source);
        }
        for fact in &mut self.facts {
            fact.sources.iter_mut().for_each(resolve);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let targets = self
            .dimensions
            .iter()
            .map(|d| &d.target)
            .chain(self.facts.iter().map(|f| &f.target));
        for target in targets {
            if target.table.trim().is_empty() {
                return Err(LoadError::Config("catalogue entry with empty table name".into()));
            }
            if target.conflict_key.trim().is_empty() {
                return Err(LoadError::Config(format!(
                    "table {} has an empty conflict key",
                    target.table
                )));
            }
        }
        if let Some(fact) = self.facts.iter().find(|f| f.sources.is_empty()) {
            return Err(LoadError::Config(format!(
                "fact table {} lists no source files",
                fact.target.table
            )));
        }
        Ok(())
    }

    /// Number of (source, table) loads the plan describes.
    pub fn source_count(&self) -> usize {
        self.dimensions.len() + self.facts.iter().map(|f| f.sources.len()).sum::<usize>()
    }
}
