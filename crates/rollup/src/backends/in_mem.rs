//! # Previously, on Rollup...
//!
//! 🎬 The cluster was down. The laptop was on a plane. The tests still had to run.
//! Someone had to write a backend so simple it lives entirely in RAM, evaluates
//! grouped aggregations over a few hand-written documents, and forgets everything
//! the moment the test ends.
//!
//! That someone was this module.
//!
//! - [`InMemorySource`] answers grouped queries, either by actually evaluating them over
//!   a set of documents (filter, group, count, average, sum, sample) or by replaying a
//!   scripted list of pages when a test wants total control over tokens.
//! - [`InMemoryStore`] keeps upserted records in a map keyed by identifier, so reruns
//!   overwrite exactly like the real thing. It can be told to refuse specific ids, or to
//!   pretend the network fell over.
//!
//! ⚠️ This is NOT for production. This is for tests and dry runs.
//! ✅ No network calls. No disk I/O. Just vibes and heap memory. 🦆

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Map, Value};

mod in_mem_sink;
mod in_mem_source;

pub use in_mem_sink::InMemoryStore;
pub use in_mem_source::InMemorySource;

/// 📦 Documents to aggregate over, keyed by collection name. Handy for dry runs from TOML.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct InMemorySourceConfig {
    #[serde(default)]
    pub collections: HashMap<String, Vec<Map<String, Value>>>,
}

/// 📦 Nothing to configure. The RAM is already here.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct InMemorySinkConfig {}
