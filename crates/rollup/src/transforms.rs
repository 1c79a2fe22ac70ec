//! 🔄 Transforms: turning finished records into whatever bytes a store wants to eat.
//!
//! 🧠 Knowledge graph: the pipeline builds `OutputRecord`s that know nothing about any wire
//! format. Right before a batch leaves the process, an `EgressTransform` renders each one for
//! its store. Today there is exactly one store with opinions about bytes (Elasticsearch's
//! `_bulk` NDJSON), so there is exactly one transform. The trait stays so the next one has a
//! door to walk through.

use anyhow::Result;

use crate::common::OutputRecord;

pub(crate) mod elasticsearch;

pub(crate) use elasticsearch::ElasticsearchBulk;

/// 📤 Render one record for a store, and a batch of them as a single request body.
pub(crate) trait EgressTransform {
    fn transform_record(record: &OutputRecord) -> Result<String>;

    /// 📦 Every record, newline-terminated, concatenated. Bulk APIs want the trailing newline.
    fn render_batch(records: &[OutputRecord]) -> Result<String> {
        let mut body = String::new();
        for record in records {
            body.push_str(&Self::transform_record(record)?);
            body.push('\n');
        }
        Ok(body)
    }
}
