//! 📚 Reference Data: the small lookup tables every record gets enriched from.
//!
//! Two shapes:
//! - **name tables**: code → human name. Airports, carriers, city markets. Read from
//!   two-column `Code,Description` CSV files.
//! - **flag tables**: code → bool. "Is this city market domestic?" Pulled from a reference
//!   collection in the source store with one bulk search.
//!
//! Loaded once, before any partition runs, then shared read-only behind an `Arc`. No locks,
//! no refreshes, no surprises. A missing entry is never an error: lookups just come back empty.
//!
//! ⚠️ The one exception: a flag table that comes back empty, or with the same code twice,
//! fails the run at startup. Enriching every record with "false" because the lookup
//! collection was missing is worse than not running at all.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, info};

use crate::backends::ReferenceProvider;
use crate::common::json_text;

/// ✂️ How to clean a CSV description before it goes into a name table.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub enum DescriptionTrim {
    #[default]
    Keep,
    /// Keep the part after the first `sep`; the whole description if there is none.
    /// `"Dallas/Fort Worth, TX: Dallas/Fort Worth International"` → the airport name.
    After(String),
    /// Keep the part before the first `sep`. `"Dallas, TX (Metropolitan Area)"` style.
    Before(String),
}

impl DescriptionTrim {
    pub fn apply(&self, description: &str) -> String {
        match self {
            DescriptionTrim::Keep => description.to_string(),
            DescriptionTrim::After(sep) => description
                .split(sep.as_str())
                .nth(1)
                .unwrap_or(description)
                .to_string(),
            DescriptionTrim::Before(sep) => description
                .split(sep.as_str())
                .next()
                .unwrap_or(description)
                .to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct NameTableConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub trim: DescriptionTrim,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FlagTableConfig {
    pub name: String,
    pub collection: String,
    #[serde(default = "default_key_field")]
    pub key_field: String,
    #[serde(default = "default_flag_field")]
    pub flag_field: String,
    #[serde(default = "default_fetch_size")]
    pub size: usize,
}

fn default_key_field() -> String {
    "code".to_string()
}

fn default_flag_field() -> String {
    "domestic".to_string()
}

fn default_fetch_size() -> usize {
    10_000
}

/// 📚 Which lookup tables to load, and from where.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ReferenceConfig {
    #[serde(default)]
    pub name_tables: Vec<NameTableConfig>,
    #[serde(default)]
    pub flag_tables: Vec<FlagTableConfig>,
}

/// 📚 Every loaded lookup table, by table name. Read-only once built.
#[derive(Debug, Default, Clone)]
pub struct ReferenceData {
    names: HashMap<String, HashMap<String, String>>,
    flags: HashMap<String, HashMap<String, bool>>,
}

impl ReferenceData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_names(&mut self, table: impl Into<String>, entries: HashMap<String, String>) {
        self.names.insert(table.into(), entries);
    }

    pub fn insert_flags(&mut self, table: impl Into<String>, entries: HashMap<String, bool>) {
        self.flags.insert(table.into(), entries);
    }

    /// 🔍 `None` for an unknown table or an unknown code. Callers decide the default.
    pub fn name(&self, table: &str, code: &str) -> Option<&str> {
        self.names.get(table)?.get(code).map(String::as_str)
    }

    pub fn flag(&self, table: &str, code: &str) -> Option<bool> {
        self.flags.get(table)?.get(code).copied()
    }

    pub fn table_sizes(&self) -> Vec<(String, usize)> {
        let mut sizes: Vec<(String, usize)> = self
            .names
            .iter()
            .map(|(name, table)| (name.clone(), table.len()))
            .chain(self.flags.iter().map(|(name, table)| (name.clone(), table.len())))
            .collect();
        sizes.sort();
        sizes
    }
}

/// 📄 Read a `Code,Description` CSV into a code → name map. The header row (or any row
/// whose code is literally `Code`) is skipped, as are rows with fewer than two columns.
pub fn read_name_table(path: &Path, trim: &DescriptionTrim) -> Result<HashMap<String, String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("💀 Could not open reference table '{}'. It was right there. It is not there now.", path.display()))?;

    let mut table = HashMap::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| {
            format!("💀 Reference table '{}' is not valid CSV at record {}.", path.display(), line + 1)
        })?;
        let (Some(code), Some(description)) = (record.get(0), record.get(1)) else {
            continue;
        };
        if code == "Code" {
            continue;
        }
        table.insert(code.to_string(), trim.apply(description));
    }
    debug!("📄 read {} entries from {}", table.len(), path.display());
    Ok(table)
}

/// 🚩 Turn fetched rows into a code → flag map. Empty or duplicated codes are fatal.
fn build_flag_table(config: &FlagTableConfig, rows: &[serde_json::Map<String, serde_json::Value>]) -> Result<HashMap<String, bool>> {
    if rows.is_empty() {
        bail!(
            "💀 Flag table '{}' came back empty from '{}'. Every lookup would be 'false'. Refusing to pretend that's fine.",
            config.name,
            config.collection
        );
    }
    let mut table = HashMap::with_capacity(rows.len());
    for row in rows {
        let code = row.get(&config.key_field).map(json_text).unwrap_or_default();
        let flag = row
            .get(&config.flag_field)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if table.insert(code.clone(), flag).is_some() {
            bail!(
                "💀 Flag table '{}' has code '{}' more than once. Which one is true? Nobody knows.",
                config.name,
                code
            );
        }
    }
    Ok(table)
}

/// 🚀 Load every configured table. CSV reads run on the blocking pool; flag tables are one
/// bulk fetch each from `provider`.
pub async fn load<P>(config: &ReferenceConfig, provider: &P) -> Result<ReferenceData>
where
    P: ReferenceProvider + ?Sized,
{
    let mut data = ReferenceData::new();

    for table in &config.name_tables {
        let path = table.path.clone();
        let trim = table.trim.clone();
        let entries = tokio::task::spawn_blocking(move || read_name_table(&path, &trim))
            .await
            .context("💀 The CSV reader thread vanished mid-read.")??;
        info!("📚 loaded name table '{}' ({} entries)", table.name, entries.len());
        data.insert_names(table.name.clone(), entries);
    }

    for table in &config.flag_tables {
        let rows = provider
            .fetch_all(&table.collection, table.size)
            .await
            .with_context(|| format!("💀 Could not fetch flag table '{}' from '{}'.", table.name, table.collection))?;
        let entries = build_flag_table(table, &rows)?;
        info!("📚 loaded flag table '{}' ({} entries)", table.name, entries.len());
        data.insert_flags(table.name.clone(), entries);
    }

    Ok(data)
}
