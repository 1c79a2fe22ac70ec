use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::backends::DocumentStore;
use crate::common::{BulkItemFailure, OutputRecord};

/// 📦 A document store that never forgets (until the test ends).
///
/// Records are kept per collection, keyed by identifier, so a second upsert with the same
/// id replaces the first. Exactly the overwrite semantics the real store gives us.
///
/// Clone-able because tests hand one copy to the pipeline and keep another for assertions.
/// The `Arc`s mean everyone shares the same maps.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    documents: Arc<Mutex<HashMap<String, HashMap<String, Map<String, Value>>>>>,
    batch_sizes: Arc<Mutex<Vec<usize>>>,
    ensured: Arc<Mutex<Vec<String>>>,
    attempts: Arc<AtomicU64>,
    failing_ids: Arc<HashSet<String>>,
    transport_down: bool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 💣 Refuse these identifiers with a per-item 500, accept everything else.
    pub fn failing_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing_ids = Arc::new(ids.into_iter().map(Into::into).collect());
        self
    }

    /// 💣 Every bulk request fails as a whole, like the network cable got unplugged.
    pub fn with_transport_failure(mut self) -> Self {
        self.transport_down = true;
        self
    }

    pub async fn documents(&self, collection: &str) -> HashMap<String, Map<String, Value>> {
        self.documents
            .lock()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn ids(&self, collection: &str) -> BTreeSet<String> {
        self.documents(collection).await.into_keys().collect()
    }

    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().await.clone()
    }

    pub async fn ensured_collections(&self) -> Vec<String> {
        self.ensured.lock().await.clone()
    }

    /// 🔢 Records attempted, accepted or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn bulk_upsert(&self, batch: &[OutputRecord]) -> Result<Vec<BulkItemFailure>> {
        self.attempts.fetch_add(batch.len() as u64, Ordering::SeqCst);
        self.batch_sizes.lock().await.push(batch.len());
        if self.transport_down {
            bail!("💀 In-memory store is pretending the network is down. It is very convincing.");
        }

        let mut failures = Vec::new();
        let mut documents = self.documents.lock().await;
        for record in batch {
            if self.failing_ids.contains(&record.id) {
                failures.push(BulkItemFailure {
                    collection: record.collection.clone(),
                    id: record.id.clone(),
                    status: 500,
                    error: "injected failure".to_string(),
                });
                continue;
            }
            documents
                .entry(record.collection.clone())
                .or_default()
                .insert(record.id.clone(), record.fields.clone());
        }
        Ok(failures)
    }

    async fn ensure_collection(&self, collection: &str, _mapping: Option<&Value>) -> Result<()> {
        let mut ensured = self.ensured.lock().await;
        if !ensured.iter().any(|existing| existing == collection) {
            ensured.push(collection.to_string());
        }
        Ok(())
    }
}
