use std::io::Write;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, trace};

use super::{Credentials, build_client, endpoint, ping};
use crate::backends::{CommonSinkConfig, DocumentStore};
use crate::common::{BulkItemFailure, OutputRecord};
use crate::transforms::{EgressTransform, ElasticsearchBulk};

// ⚠️ No `index` here: every record carries its own destination collection, so one sink
// serves every report.
#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchSinkConfig {
    /// 📡 Where to send the documents.
    pub url: String,
    /// 🔒 Username. The bouncer at the club. Except the club is a database.
    #[serde(default)]
    pub username: Option<String>,
    /// 🔒 Password. "password123" is not a password. It is a confession.
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key, the velvet rope variant of authentication.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(flatten, default)]
    pub common_config: CommonSinkConfig,
}

impl ElasticsearchSinkConfig {
    fn credentials(&self) -> Credentials<'_> {
        Credentials {
            api_key: self.api_key.as_deref(),
            username: self.username.as_deref(),
            password: self.password.as_deref(),
        }
    }
}

/// 📡 `_bulk` upserts. No buffering in here: the bulk sink's batcher decides what a batch
/// is, this just ships it and reports which items bounced.
#[derive(Debug)]
pub struct ElasticsearchSink {
    client: reqwest::Client,
    sink_config: ElasticsearchSinkConfig,
}

impl ElasticsearchSink {
    /// 🚀 Build the client and ping. Index existence is checked per report in
    /// `ensure_collection`, not here, since one sink writes many indices.
    pub async fn new(config: ElasticsearchSinkConfig) -> Result<Self> {
        let client = build_client(config.common_config.request_timeout())?;
        ping(&client, &config.url, config.credentials()).await?;
        Ok(Self {
            client,
            sink_config: config,
        })
    }

    fn compress(body: &str) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(body.as_bytes())
            .context("💀 Gzip choked on the bulk body.")?;
        encoder
            .finish()
            .context("💀 Gzip could not finish the bulk body. The squish was incomplete.")
    }
}

/// 🏁 Someone else (another run, another pod) created the index after our HEAD said 404.
fn lost_the_create_race(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|body| body.pointer("/error/type").and_then(Value::as_str).map(str::to_string))
        .is_some_and(|kind| kind == "resource_already_exists_exception")
}

/// 🔍 Pull the refused items out of a `_bulk` response. Anything with an `error` or a
/// non-2xx status counts.
pub(crate) fn parse_bulk_failures(response: &Value) -> Vec<BulkItemFailure> {
    let Some(items) = response.get("items").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| item.as_object()?.values().next())
        .filter_map(|outcome| {
            let status = outcome.get("status").and_then(Value::as_u64).unwrap_or(0) as u16;
            let error = outcome.get("error");
            if error.is_none() && (200..300).contains(&status) {
                return None;
            }
            let error = match error {
                Some(Value::String(reason)) => reason.clone(),
                Some(detail) => detail
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| detail.to_string()),
                None => format!("HTTP {status}"),
            };
            Some(BulkItemFailure {
                collection: outcome.get("_index").and_then(Value::as_str).unwrap_or_default().to_string(),
                id: outcome.get("_id").and_then(Value::as_str).unwrap_or_default().to_string(),
                status,
                error,
            })
        })
        .collect()
}

#[async_trait]
impl DocumentStore for ElasticsearchSink {
    async fn bulk_upsert(&self, batch: &[OutputRecord]) -> Result<Vec<BulkItemFailure>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let body = ElasticsearchBulk::render_batch(batch)?;
        let bulk_url = endpoint(&self.sink_config.url, "_bulk");
        debug!("📡 Sending {} records ({} bytes) to {bulk_url}", batch.len(), body.len());

        // ⚠️ Content-Type: application/x-ndjson, not application/json. ES insists.
        let mut request = self
            .sink_config
            .credentials()
            .apply(self.client.post(&bulk_url))
            .header("Content-Type", "application/x-ndjson");
        request = if self.sink_config.common_config.compress {
            request
                .header("Content-Encoding", "gzip")
                .body(Self::compress(&body)?)
        } else {
            request.body(body)
        };

        let response = request
            .send()
            .await
            .context("💀 The bulk request never made it back. Check connectivity. Check your cluster. Check your horoscope.")?;
        let status = response.status();
        let text = response
            .text()
            .await
            .context("💀 The bulk response body evaporated mid-read.")?;
        if !status.is_success() {
            bail!("💀 Bulk request failed with HTTP {status}. The cluster said: {text}");
        }

        let parsed: Value = serde_json::from_str(&text)
            .context("💀 The bulk response was not JSON. We sent NDJSON with love and got gibberish back.")?;
        let failures = if parsed.get("errors").and_then(Value::as_bool).unwrap_or(false) {
            parse_bulk_failures(&parsed)
        } else {
            Vec::new()
        };
        trace!("📡 bulk of {} finished with {} item failures", batch.len(), failures.len());
        Ok(failures)
    }

    /// 🏗️ HEAD the index; on 404, PUT it with the report's mapping. Anything else is fatal.
    async fn ensure_collection(&self, collection: &str, mapping: Option<&Value>) -> Result<()> {
        let index_url = endpoint(&self.sink_config.url, collection);
        let response = self
            .sink_config
            .credentials()
            .apply(self.client.head(&index_url))
            .send()
            .await
            .with_context(|| format!("💀 Reached out to check if '{collection}' exists. Got ghosted."))?;

        match response.status().as_u16() {
            200 => {
                debug!("✅ Index '{collection}' exists and is accepting visitors");
                Ok(())
            }
            404 => {
                let body = mapping.cloned().unwrap_or_else(|| json!({}));
                let response = self
                    .sink_config
                    .credentials()
                    .apply(self.client.put(&index_url))
                    .json(&body)
                    .send()
                    .await
                    .with_context(|| format!("💀 Tried to create index '{collection}'. The request never returned."))?;
                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    if lost_the_create_race(&text) {
                        debug!("🏁 Index '{collection}' appeared between the check and the create; using it");
                        return Ok(());
                    }
                    bail!("💀 Creating index '{collection}' failed with HTTP {status}: {text}");
                }
                info!("🏗️ Created index '{collection}' with its mapping");
                Ok(())
            }
            other => bail!("💀 Checking index '{collection}' returned HTTP {other}. Neither 'yes' nor 'no'. Refusing to guess."),
        }
    }
}
