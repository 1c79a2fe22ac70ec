//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing.": every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment: `ROLLUP_*` environment variables as the base layer, an optional
//! TOML file on top. Everything a run needs lives here: where groups come from, where records
//! go, which reports over which partitions, the lookup tables, and the concurrency knobs.

use std::path::Path;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::elasticsearch::{ElasticsearchSinkConfig, ElasticsearchSourceConfig};
use crate::backends::in_mem::{InMemorySinkConfig, InMemorySourceConfig};
use crate::backends::{CommonSinkConfig, CommonSourceConfig};
use crate::common::Partition;
use crate::reference::ReferenceConfig;

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub source_config: SourceConfig,
    pub sink_config: SinkConfig,
    #[serde(default, alias = "supervisor_config")]
    pub runtime: RuntimeConfig,
    /// 📅 The (year, month) or (year, quarter) slices to process.
    #[serde(default)]
    pub partitions: Vec<Partition>,
    /// 📊 Report names to run, by catalog name. Empty means "all of them".
    #[serde(default)]
    pub reports: Vec<String>,
    #[serde(default)]
    pub reference: ReferenceConfig,
}

/// 📡 Where grouped queries and lookup collections come from.
#[derive(Debug, Deserialize, Clone)]
pub enum SourceConfig {
    Elasticsearch(ElasticsearchSourceConfig),
    InMemory(InMemorySourceConfig),
}

impl SourceConfig {
    /// 📏 Groups per page unless a report overrides it. In-memory gets the same default.
    pub fn page_size(&self) -> usize {
        match self {
            SourceConfig::Elasticsearch(es_config) => es_config.common_config.page_size,
            SourceConfig::InMemory(_) => CommonSourceConfig::default().page_size,
        }
    }
}

/// 🕳️ Where finished records go.
#[derive(Debug, Deserialize, Clone)]
pub enum SinkConfig {
    Elasticsearch(ElasticsearchSinkConfig),
    InMemory(InMemorySinkConfig),
}

impl SinkConfig {
    pub fn common_config(&self) -> CommonSinkConfig {
        match self {
            SinkConfig::Elasticsearch(es_config) => es_config.common_config.clone(),
            SinkConfig::InMemory(_) => CommonSinkConfig::default(),
        }
    }
}

/// ⚙️ The concurrency knobs.
///
/// - `sink_workers`: concurrent bulk requests in flight per report's sink.
/// - `partition_parallelism`: partitions of one report running at once. `1` is the classic
///   one-partition-at-a-time walk.
/// - `overlap_reports`: run reports concurrently instead of back to back.
/// - `queue_capacity`: records buffered between producers and the batcher before `submit`
///   starts waiting.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default = "default_sink_workers", alias = "num_sink_workers", alias = "sink_parallelism")]
    pub sink_workers: usize,
    #[serde(default = "default_partition_parallelism")]
    pub partition_parallelism: usize,
    #[serde(default)]
    pub overlap_reports: bool,
    #[serde(default = "default_queue_capacity", alias = "channel_size")]
    pub queue_capacity: usize,
}

fn default_sink_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_partition_parallelism() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    1000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sink_workers: default_sink_workers(),
            partition_parallelism: default_partition_parallelism(),
            overlap_reports: false,
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// 🚀 Load the config: from a file, from env vars, or from the sheer power of hoping.
///
/// - `None` → env vars only.
/// - `Some(path)` → env vars + TOML, merged. TOML wins on conflicts.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("ROLLUP_"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (ROLLUP_*). \
             The file exists in our hearts, but apparently not on disk.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (ROLLUP_*). \
                 No file was provided, so this one's all on the environment."
            .to_string(),
    };

    config.extract().context(context_msg)
}
