use super::EgressTransform;
use crate::common::OutputRecord;
use anyhow::{Context, Result};
use serde_json::json;

/// 📡 `OutputRecord` → `{"index":{"_index":..,"_id":..}}\n{fields}`.
///
/// `index` (not `create`) is what makes reruns idempotent: same `_id`, same slot, the newer
/// document wins. No duplicates, no 409s, no drama.
pub(crate) struct ElasticsearchBulk;

impl EgressTransform for ElasticsearchBulk {
    fn transform_record(record: &OutputRecord) -> Result<String> {
        let the_action_line = json!({
            "index": {
                "_index": record.collection,
                "_id": record.id,
            }
        });
        let the_action_serialized = serde_json::to_string(&the_action_line).context(
            "💀 Failed to serialize bulk action metadata. \
             The JSON that describes JSON has failed to become JSON.",
        )?;
        let the_source_serialized = serde_json::to_string(&record.fields).with_context(|| {
            format!(
                "💀 Record '{}' for '{}' refused to become JSON. Its fields have secrets.",
                record.id, record.collection
            )
        })?;

        Ok(format!("{}\n{}", the_action_serialized, the_source_serialized))
    }
}
