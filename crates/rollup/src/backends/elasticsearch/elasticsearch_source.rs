use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use tracing::{debug, trace};

use super::{Credentials, build_client, endpoint, ping};
use crate::backends::{CommonSourceConfig, QuerySource, ReferenceProvider};
use crate::common::{ContinuationToken, Group, GroupPage, KeyValue, SubAggregationValue};
use crate::cursor::{GroupedQuery, Predicate, SubAggregationKind};

/// 📛 Name of the composite aggregation in every request. Also where we look in the response.
const GROUPS_AGG: &str = "groups";

// 📡 ElasticsearchSourceConfig: "It's just Elasticsearch", she said, before the cluster went red.
//
// 🔧 auth is tri-modal: username+password, api_key, or "I hope anonymous works" (it won't).
#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchSourceConfig {
    /// 📡 The URL of your Elasticsearch cluster. Include scheme + port. Yes, all of it.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key auth. Preferred over basic auth.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(flatten, default)]
    pub common_config: CommonSourceConfig,
}

impl ElasticsearchSourceConfig {
    fn credentials(&self) -> Credentials<'_> {
        Credentials {
            api_key: self.api_key.as_deref(),
            username: self.username.as_deref(),
            password: self.password.as_deref(),
        }
    }
}

/// 📡 Grouped queries via composite aggregations, lookups via `_search`.
#[derive(Debug)]
pub struct ElasticsearchSource {
    client: reqwest::Client,
    source_config: ElasticsearchSourceConfig,
}

impl ElasticsearchSource {
    /// 🚀 Build the client and ping the cluster. A dead cluster fails here, before any query.
    pub async fn new(config: ElasticsearchSourceConfig) -> Result<Self> {
        let client = build_client(config.common_config.request_timeout())?;
        ping(&client, &config.url, config.credentials()).await?;
        Ok(Self {
            client,
            source_config: config,
        })
    }

    async fn search(&self, collection: &str, body: &Value) -> Result<Value> {
        let url = endpoint(&self.source_config.url, &format!("{collection}/_search"));
        trace!("📡 POST {url} {body}");
        let response = self
            .source_config
            .credentials()
            .apply(self.client.post(&url))
            .json(body)
            .send()
            .await
            .with_context(|| format!("💀 The search request to '{url}' never came back. Timeout, network, or a cluster having a moment."))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("💀 The search response body evaporated mid-read.")?;
        if !status.is_success() {
            bail!("💀 Search on '{collection}' failed with HTTP {status}: {text}");
        }
        serde_json::from_str(&text)
            .with_context(|| format!("💀 Search on '{collection}' returned something that is not JSON. It was: {text}"))
    }
}

// ============================================================
// 🏗️ Request body
// ============================================================

fn predicate_clause(predicate: &Predicate) -> Value {
    match predicate {
        Predicate::Term { field, value } => json!({ "term": { field: value.to_json() } }),
        Predicate::LessThan { field, value } => json!({ "range": { field: { "lt": value } } }),
        Predicate::GreaterThan { field, value } => json!({ "range": { field: { "gt": value } } }),
    }
}

fn sub_aggregation_body(kind: &SubAggregationKind) -> Value {
    match kind {
        SubAggregationKind::FilterCount(predicates) => json!({
            "filter": { "bool": { "filter": predicates.iter().map(predicate_clause).collect::<Vec<_>>() } }
        }),
        SubAggregationKind::Avg { field, missing } => {
            json!({ "avg": { "field": field, "missing": missing } })
        }
        SubAggregationKind::Sum { field, missing } => {
            json!({ "sum": { "field": field, "missing": missing } })
        }
        SubAggregationKind::TopSample { size, includes } => json!({
            "top_hits": { "size": size, "_source": { "includes": includes } }
        }),
    }
}

/// 🏗️ One composite aggregation: exact-match filter, one `terms` source per grouping field
/// in order, the sub-aggregations nested inside, and `after` when we have a token.
pub(crate) fn composite_body(query: &GroupedQuery, token: Option<&ContinuationToken>) -> Value {
    let filter: Vec<Value> = query
        .filter
        .iter()
        .map(|(field, value)| json!({ "term": { field: value.to_json() } }))
        .collect();
    let sources: Vec<Value> = query
        .grouping_fields
        .iter()
        .map(|field| json!({ field: { "terms": { "field": field } } }))
        .collect();
    let sub_aggregations: Map<String, Value> = query
        .sub_aggregations
        .iter()
        .map(|aggregation| (aggregation.name.clone(), sub_aggregation_body(&aggregation.kind)))
        .collect();

    let mut composite = json!({ "size": query.page_size, "sources": sources });
    if let Some(ContinuationToken(after)) = token {
        composite["after"] = after.clone();
    }

    json!({
        "size": 0,
        "query": { "bool": { "filter": filter } },
        "aggs": {
            GROUPS_AGG: {
                "composite": composite,
                "aggs": sub_aggregations,
            }
        }
    })
}

// ============================================================
// 🔍 Response parsing
// ============================================================

fn parse_bucket(query: &GroupedQuery, bucket: &Value) -> Result<Group> {
    let key_object = bucket
        .get("key")
        .and_then(Value::as_object)
        .context("💀 A composite bucket arrived without a key. A group with no identity.")?;
    let key = query
        .grouping_fields
        .iter()
        .map(|field| {
            key_object
                .get(field)
                .and_then(KeyValue::from_json)
                .map(|value| (field.clone(), value))
                .with_context(|| format!("💀 Bucket key is missing grouping field '{field}': {bucket}"))
        })
        .collect::<Result<Vec<_>>>()?;
    let doc_count = bucket.get("doc_count").and_then(Value::as_u64).unwrap_or(0);

    let mut sub_aggregations = HashMap::new();
    let mut sample = None;
    for aggregation in &query.sub_aggregations {
        let Some(result) = bucket.get(&aggregation.name) else {
            continue;
        };
        match &aggregation.kind {
            SubAggregationKind::FilterCount(_) => {
                let count = result.get("doc_count").and_then(Value::as_u64).unwrap_or(0);
                sub_aggregations.insert(aggregation.name.clone(), SubAggregationValue::Count(count));
            }
            SubAggregationKind::Avg { .. } | SubAggregationKind::Sum { .. } => {
                let value = result.get("value").and_then(Value::as_f64);
                sub_aggregations.insert(aggregation.name.clone(), SubAggregationValue::Metric(value));
            }
            SubAggregationKind::TopSample { .. } => {
                sample = result
                    .pointer("/hits/hits/0/_source")
                    .and_then(Value::as_object)
                    .cloned();
            }
        }
    }

    Ok(Group {
        key,
        doc_count,
        sub_aggregations,
        sample,
    })
}

/// 🔍 Buckets become groups; `after_key` becomes the next token. An empty bucket list is
/// the end, whatever `after_key` says.
pub(crate) fn parse_composite_response(query: &GroupedQuery, response: &Value) -> Result<GroupPage> {
    let aggregation = response
        .pointer(&format!("/aggregations/{GROUPS_AGG}"))
        .with_context(|| format!("💀 Response has no '{GROUPS_AGG}' aggregation. Did the index exist? Response: {response}"))?;
    let buckets = aggregation
        .get("buckets")
        .and_then(Value::as_array)
        .context("💀 The composite aggregation came back without a buckets array.")?;

    let groups = buckets
        .iter()
        .map(|bucket| parse_bucket(query, bucket))
        .collect::<Result<Vec<_>>>()?;
    let next_token = if groups.is_empty() {
        None
    } else {
        aggregation
            .get("after_key")
            .filter(|after| !after.is_null())
            .cloned()
            .map(ContinuationToken)
    };
    Ok(GroupPage { groups, next_token })
}

#[async_trait]
impl QuerySource for ElasticsearchSource {
    async fn query(
        &self,
        query: &GroupedQuery,
        token: Option<&ContinuationToken>,
    ) -> Result<GroupPage> {
        let body = composite_body(query, token);
        let response = self.search(&query.collection, &body).await?;
        let page = parse_composite_response(query, &response)?;
        debug!(
            "📃 '{}' page: {} groups, more = {}",
            query.collection,
            page.groups.len(),
            page.next_token.is_some()
        );
        Ok(page)
    }
}

#[async_trait]
impl ReferenceProvider for ElasticsearchSource {
    async fn fetch_all(&self, collection: &str, size: usize) -> Result<Vec<Map<String, Value>>> {
        let body = json!({ "size": size, "query": { "match_all": {} } });
        let response = self.search(collection, &body).await?;
        let hits = response
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .with_context(|| format!("💀 Lookup search on '{collection}' came back without hits."))?;
        Ok(hits
            .iter()
            .filter_map(|hit| hit.get("_source").and_then(Value::as_object).cloned())
            .collect())
    }
}
