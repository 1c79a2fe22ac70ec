//! 🔌 Backends: where the real I/O happens.
//!
//! 🚰 Source backends answer grouped queries and hand over lookup collections.
//! Sink backends upsert records by identifier. Everything in between is pure logic.
//!
//! 🎭 This module is the casting agency. Need a real cluster? Elasticsearch.
//! Need a cluster that lives in RAM and evaluates aggregations over a handful of
//! test documents? In-memory. Same traits, same pipeline, different electricity bill.
//!
//! 🦆 The duck is here because every file must have one. This is law.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::app_config::{SinkConfig, SourceConfig};
use crate::common::{BulkItemFailure, ContinuationToken, GroupPage, OutputRecord};
use crate::cursor::GroupedQuery;

pub mod common_config;
pub mod elasticsearch;
pub mod in_mem;

pub use common_config::{CommonSinkConfig, CommonSourceConfig};

// ===== Capability traits =====

/// 📡 Something that can run a grouped aggregation and hand back one page of it.
///
/// # Contract
/// - `token` is `None` on the first call and the previous page's token afterwards.
/// - `GroupPage::next_token == None` means "that was the last page".
/// - Errors (including timeouts) are errors. Never an empty page in disguise.
#[async_trait]
pub trait QuerySource: std::fmt::Debug + Send + Sync {
    async fn query(
        &self,
        query: &GroupedQuery,
        token: Option<&ContinuationToken>,
    ) -> Result<GroupPage>;
}

/// 📚 Bulk read of a small lookup collection. Called once at startup, never again.
#[async_trait]
pub trait ReferenceProvider: std::fmt::Debug + Send + Sync {
    async fn fetch_all(&self, collection: &str, size: usize) -> Result<Vec<Map<String, Value>>>;
}

/// 🕳️ Where records go to live (or be overwritten, lovingly, on rerun).
///
/// # Contract
/// - `bulk_upsert` writes a batch in as few round trips as it can. Item-level refusals are
///   returned as `BulkItemFailure`s; `Err` means the whole batch never landed.
/// - `ensure_collection` creates the destination with its mapping if it doesn't exist yet.
#[async_trait]
pub trait DocumentStore: std::fmt::Debug + Send + Sync {
    async fn bulk_upsert(&self, batch: &[OutputRecord]) -> Result<Vec<BulkItemFailure>>;
    async fn ensure_collection(&self, collection: &str, mapping: Option<&Value>) -> Result<()>;
}

// ===== Source backend enum =====

/// 🎭 The many faces of a source. Enum dispatch, no vtables, no surprises.
#[derive(Debug)]
pub enum SourceBackend {
    InMemory(in_mem::InMemorySource),
    Elasticsearch(elasticsearch::ElasticsearchSource),
}

impl SourceBackend {
    /// 🚀 Stand up the configured source. Connection problems surface here, before any
    /// partition runs, which is exactly where we want them.
    pub async fn from_config(config: &SourceConfig) -> Result<Self> {
        match config {
            SourceConfig::InMemory(in_mem_config) => Ok(SourceBackend::InMemory(
                in_mem::InMemorySource::from_config(in_mem_config),
            )),
            SourceConfig::Elasticsearch(es_config) => Ok(SourceBackend::Elasticsearch(
                elasticsearch::ElasticsearchSource::new(es_config.clone())
                    .await
                    .context("💀 Could not stand up the Elasticsearch source. Nothing has been queried yet, nothing has been written. Clean failure, at least.")?,
            )),
        }
    }
}

#[async_trait]
impl QuerySource for SourceBackend {
    async fn query(
        &self,
        query: &GroupedQuery,
        token: Option<&ContinuationToken>,
    ) -> Result<GroupPage> {
        match self {
            SourceBackend::InMemory(source) => source.query(query, token).await,
            SourceBackend::Elasticsearch(source) => source.query(query, token).await,
        }
    }
}

#[async_trait]
impl ReferenceProvider for SourceBackend {
    async fn fetch_all(&self, collection: &str, size: usize) -> Result<Vec<Map<String, Value>>> {
        match self {
            SourceBackend::InMemory(source) => source.fetch_all(collection, size).await,
            SourceBackend::Elasticsearch(source) => source.fetch_all(collection, size).await,
        }
    }
}

// ===== Sink backend enum =====

/// 🎭 Mirrors `SourceBackend` on the other end of the pipeline.
#[derive(Debug)]
pub enum SinkBackend {
    InMemory(in_mem::InMemoryStore),
    Elasticsearch(elasticsearch::ElasticsearchSink),
}

impl SinkBackend {
    pub async fn from_config(config: &SinkConfig) -> Result<Self> {
        match config {
            SinkConfig::InMemory(_) => Ok(SinkBackend::InMemory(in_mem::InMemoryStore::new())),
            SinkConfig::Elasticsearch(es_config) => Ok(SinkBackend::Elasticsearch(
                elasticsearch::ElasticsearchSink::new(es_config.clone())
                    .await
                    .context("💀 Could not stand up the Elasticsearch sink. The documents have nowhere to go, so we're not going to make any.")?,
            )),
        }
    }
}

#[async_trait]
impl DocumentStore for SinkBackend {
    async fn bulk_upsert(&self, batch: &[OutputRecord]) -> Result<Vec<BulkItemFailure>> {
        match self {
            SinkBackend::InMemory(store) => store.bulk_upsert(batch).await,
            SinkBackend::Elasticsearch(store) => store.bulk_upsert(batch).await,
        }
    }

    async fn ensure_collection(&self, collection: &str, mapping: Option<&Value>) -> Result<()> {
        match self {
            SinkBackend::InMemory(store) => store.ensure_collection(collection, mapping).await,
            SinkBackend::Elasticsearch(store) => store.ensure_collection(collection, mapping).await,
        }
    }
}
