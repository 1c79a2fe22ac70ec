use std::collections::{BTreeMap, HashMap, VecDeque};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::InMemorySourceConfig;
use crate::backends::{QuerySource, ReferenceProvider};
use crate::common::{ContinuationToken, Group, GroupPage, KeyValue, SubAggregationValue};
use crate::cursor::{GroupedQuery, SubAggregationKind};

/// 📦 An aggregation engine small enough to fit in a unit test.
///
/// Two modes:
/// - **documents**: queries are evaluated for real. Groups come back sorted by key text,
///   the continuation token is the offset of the next group, and the last page has none.
/// - **scripted**: pages are replayed in order, tokens and all. Requests past the script
///   get an empty, token-less page.
///
/// Every request's token is recorded so tests can check what the cursor echoed back.
#[derive(Debug, Default)]
pub struct InMemorySource {
    collections: HashMap<String, Vec<Map<String, Value>>>,
    script: Option<Mutex<VecDeque<GroupPage>>>,
    fail_on_request: Option<usize>,
    failing_filters: Vec<Vec<(String, KeyValue)>>,
    requests: Mutex<Vec<Option<ContinuationToken>>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &InMemorySourceConfig) -> Self {
        Self {
            collections: config.collections.clone(),
            ..Self::default()
        }
    }

    /// 📚 Add (or replace) a collection of documents.
    pub fn with_collection(
        mut self,
        collection: impl Into<String>,
        documents: Vec<Map<String, Value>>,
    ) -> Self {
        self.collections.insert(collection.into(), documents);
        self
    }

    /// 🎬 Replay these pages verbatim, in order.
    pub fn scripted(pages: Vec<GroupPage>) -> Self {
        Self {
            script: Some(Mutex::new(pages.into())),
            ..Self::default()
        }
    }

    /// 💣 The n-th request (1-based) fails.
    pub fn failing_on_request(mut self, request_number: usize) -> Self {
        self.fail_on_request = Some(request_number);
        self
    }

    /// 💣 Any request whose exact-match filter equals `filter` fails.
    pub fn failing_for_filter(mut self, filter: Vec<(String, KeyValue)>) -> Self {
        self.failing_filters.push(filter);
        self
    }

    pub async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }

    pub async fn received_tokens(&self) -> Vec<Option<ContinuationToken>> {
        self.requests.lock().await.clone()
    }

    /// 🧮 Evaluate a grouped query over the stored documents, starting at group `offset`.
    pub(crate) fn evaluate(&self, query: &GroupedQuery, offset: usize) -> GroupPage {
        let Some(documents) = self.collections.get(&query.collection) else {
            return GroupPage::default();
        };

        // 🔑 BTreeMap keyed by key text keeps page order stable across calls.
        let mut buckets: BTreeMap<Vec<String>, (Vec<(String, KeyValue)>, Vec<&Map<String, Value>>)> =
            BTreeMap::new();
        for document in documents.iter().filter(|d| query.filter_matches(d)) {
            let key: Option<Vec<(String, KeyValue)>> = query
                .grouping_fields
                .iter()
                .map(|field| {
                    document
                        .get(field)
                        .and_then(KeyValue::from_json)
                        .map(|value| (field.clone(), value))
                })
                .collect();
            // 🗑️ documents missing a grouping field don't form a bucket, same as the real engine
            let Some(key) = key else { continue };
            let sort_key = key.iter().map(|(_, value)| value.to_text()).collect();
            buckets
                .entry(sort_key)
                .or_insert_with(|| (key, Vec::new()))
                .1
                .push(document);
        }

        let total = buckets.len();
        let groups: Vec<Group> = buckets
            .into_values()
            .skip(offset)
            .take(query.page_size.max(1))
            .map(|(key, members)| aggregate_bucket(query, key, &members))
            .collect();
        let consumed = offset + groups.len();
        let next_token =
            (consumed < total).then(|| ContinuationToken(Value::from(consumed as u64)));
        GroupPage { groups, next_token }
    }
}

fn numeric(document: &Map<String, Value>, field: &str) -> Option<f64> {
    document
        .get(field)
        .and_then(KeyValue::from_json)
        .and_then(|value| value.to_float())
}

fn aggregate_bucket(
    query: &GroupedQuery,
    key: Vec<(String, KeyValue)>,
    members: &[&Map<String, Value>],
) -> Group {
    let mut sub_aggregations = HashMap::new();
    let mut sample = None;
    for aggregation in &query.sub_aggregations {
        match &aggregation.kind {
            SubAggregationKind::FilterCount(predicates) => {
                let count = members
                    .iter()
                    .filter(|document| predicates.iter().all(|p| p.matches(document)))
                    .count() as u64;
                sub_aggregations.insert(aggregation.name.clone(), SubAggregationValue::Count(count));
            }
            SubAggregationKind::Avg { field, missing } => {
                let value = if members.is_empty() {
                    None
                } else {
                    let sum: f64 = members
                        .iter()
                        .map(|document| numeric(document, field).unwrap_or(*missing))
                        .sum();
                    Some(sum / members.len() as f64)
                };
                sub_aggregations.insert(aggregation.name.clone(), SubAggregationValue::Metric(value));
            }
            SubAggregationKind::Sum { field, missing } => {
                let sum: f64 = members
                    .iter()
                    .map(|document| numeric(document, field).unwrap_or(*missing))
                    .sum();
                sub_aggregations
                    .insert(aggregation.name.clone(), SubAggregationValue::Metric(Some(sum)));
            }
            SubAggregationKind::TopSample { includes, .. } => {
                sample = members.first().map(|document| {
                    includes
                        .iter()
                        .filter_map(|field| {
                            document.get(field).map(|value| (field.clone(), value.clone()))
                        })
                        .collect::<Map<String, Value>>()
                });
            }
        }
    }

    Group {
        key,
        doc_count: members.len() as u64,
        sub_aggregations,
        sample,
    }
}

#[async_trait]
impl QuerySource for InMemorySource {
    async fn query(
        &self,
        query: &GroupedQuery,
        token: Option<&ContinuationToken>,
    ) -> Result<GroupPage> {
        let request_number = {
            let mut requests = self.requests.lock().await;
            requests.push(token.cloned());
            requests.len()
        };

        if self.fail_on_request == Some(request_number) {
            bail!("💀 In-memory source was told to fail request {request_number}, and it is a very obedient source.");
        }
        if self.failing_filters.iter().any(|filter| *filter == query.filter) {
            bail!(
                "💀 In-memory source was told to fail queries filtered on {:?}. Consider it failed.",
                query.filter
            );
        }

        if let Some(script) = &self.script {
            return Ok(script.lock().await.pop_front().unwrap_or_default());
        }

        let offset = match token {
            None => 0,
            Some(ContinuationToken(value)) => value
                .as_u64()
                .context("💀 In-memory continuation tokens are plain offsets. This one was not.")?
                as usize,
        };
        Ok(self.evaluate(query, offset))
    }
}

#[async_trait]
impl ReferenceProvider for InMemorySource {
    async fn fetch_all(&self, collection: &str, size: usize) -> Result<Vec<Map<String, Value>>> {
        Ok(self
            .collections
            .get(collection)
            .map(|documents| documents.iter().take(size).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{Predicate, SubAggregation};
    use proptest::prelude::*;
    use serde_json::json;

    fn doc(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn the_query(page_size: usize) -> GroupedQuery {
        GroupedQuery {
            collection: "on_time_data".into(),
            filter: vec![("year".into(), KeyValue::Int(2020))],
            grouping_fields: vec!["carrier".into()],
            sub_aggregations: vec![
                SubAggregation {
                    name: "late".into(),
                    kind: SubAggregationKind::FilterCount(vec![
                        Predicate::GreaterThan { field: "delay".into(), value: 0.0 },
                        Predicate::Term { field: "cancelled".into(), value: KeyValue::Int(0) },
                    ]),
                },
                SubAggregation {
                    name: "early".into(),
                    kind: SubAggregationKind::FilterCount(vec![
                        Predicate::LessThan { field: "delay".into(), value: 0.0 },
                        Predicate::Term { field: "cancelled".into(), value: KeyValue::Int(0) },
                    ]),
                },
                SubAggregation {
                    name: "cancelled".into(),
                    kind: SubAggregationKind::FilterCount(vec![Predicate::Term {
                        field: "cancelled".into(),
                        value: KeyValue::Int(1),
                    }]),
                },
                SubAggregation {
                    name: "avg_fare".into(),
                    kind: SubAggregationKind::Avg { field: "fare".into(), missing: 0.0 },
                },
                SubAggregation {
                    name: "sample".into(),
                    kind: SubAggregationKind::TopSample { size: 1, includes: vec!["city".into()] },
                },
            ],
            page_size,
        }
    }

    #[tokio::test]
    async fn the_one_where_ram_pretends_to_be_a_cluster() -> Result<()> {
        let the_source = InMemorySource::new().with_collection(
            "on_time_data",
            vec![
                doc(json!({"year": 2020, "carrier": "AA", "delay": 5, "cancelled": 0, "fare": 100, "city": "Dallas, TX"})),
                doc(json!({"year": 2020, "carrier": "AA", "delay": -3, "cancelled": 0})),
                doc(json!({"year": 2020, "carrier": "AA", "delay": 0, "cancelled": 1, "fare": 50})),
                doc(json!({"year": 2020, "carrier": "DL", "delay": 1, "cancelled": 0})),
                doc(json!({"year": 2019, "carrier": "UA", "delay": 1, "cancelled": 0})),
                doc(json!({"year": 2020, "delay": 1, "cancelled": 0})),
            ],
        );

        let page = the_source.query(&the_query(10), None).await?;
        assert_eq!(page.next_token, None);
        assert_eq!(page.groups.len(), 2, "2019 and the carrier-less doc don't make the cut");

        let aa = &page.groups[0];
        assert_eq!(aa.key_value("carrier"), Some(&KeyValue::Str("AA".into())));
        assert_eq!(aa.doc_count, 3);
        assert_eq!(aa.sub_aggregation("late"), Some(&SubAggregationValue::Count(1)));
        assert_eq!(aa.sub_aggregation("early"), Some(&SubAggregationValue::Count(1)));
        assert_eq!(aa.sub_aggregation("cancelled"), Some(&SubAggregationValue::Count(1)));
        assert_eq!(aa.sub_aggregation("avg_fare"), Some(&SubAggregationValue::Metric(Some(50.0))));
        assert_eq!(aa.sample.as_ref().and_then(|s| s.get("city")), Some(&json!("Dallas, TX")));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_offsets_make_excellent_tokens() -> Result<()> {
        let documents = ["AA", "B6", "DL", "UA", "WN"]
            .iter()
            .map(|c| doc(json!({"year": 2020, "carrier": c})))
            .collect();
        let the_source = InMemorySource::new().with_collection("on_time_data", documents);

        let first = the_source.query(&the_query(2), None).await?;
        assert_eq!(first.groups.len(), 2);
        let token = first.next_token.expect("more pages after the first two");
        let second = the_source.query(&the_query(2), Some(&token)).await?;
        let token = second.next_token.expect("one more page");
        let third = the_source.query(&the_query(2), Some(&token)).await?;
        assert_eq!(third.groups.len(), 1);
        assert_eq!(third.next_token, None);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_reference_collections_come_back_whole() -> Result<()> {
        let the_source = InMemorySource::new().with_collection(
            "city_info",
            vec![doc(json!({"code": "1"})), doc(json!({"code": "2"}))],
        );
        assert_eq!(the_source.fetch_all("city_info", 10).await?.len(), 2);
        assert_eq!(the_source.fetch_all("city_info", 1).await?.len(), 1);
        assert!(the_source.fetch_all("nope", 10).await?.is_empty());
        Ok(())
    }

    fn arb_flight() -> impl Strategy<Value = Map<String, Value>> {
        (
            prop_oneof![Just("AA"), Just("DL"), Just("UA")],
            -30i64..30,
            prop_oneof![Just(0i64), Just(1i64)],
        )
            .prop_map(|(carrier, delay, cancelled)| {
                doc(json!({"year": 2020, "carrier": carrier, "delay": delay, "cancelled": cancelled}))
            })
    }

    proptest! {
        // 📐 early / late / cancelled are disjoint filters, so their counts can never
        // add up to more than the bucket's doc count. Exact zeros fall through the gap.
        #[test]
        fn disjoint_counts_never_exceed_doc_count(flights in prop::collection::vec(arb_flight(), 0..60)) {
            let the_source = InMemorySource::new().with_collection("on_time_data", flights);
            let page = the_source.evaluate(&the_query(100), 0);
            for group in &page.groups {
                let count = |name: &str| match group.sub_aggregation(name) {
                    Some(SubAggregationValue::Count(n)) => *n,
                    _ => 0,
                };
                prop_assert!(count("late") + count("early") + count("cancelled") <= group.doc_count);
            }
        }
    }
}
