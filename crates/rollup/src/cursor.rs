//! 🧭 The Grouped Query Cursor: pages through server-side groups, one token at a time.
//!
//! 🎬 *[a cursor stands at the edge of an unbounded result set. it has a token. it has a page size.]*
//! *[it does not know how many pages remain. nobody does. that's the point of a cursor.]*
//!
//! The contract, in order:
//! 1. Every request carries the partition filter, the grouping fields, the sub-aggregations,
//!    the page size, and the previous page's continuation token (absent the first time).
//! 2. Page N+1 is never requested before page N's token is known. Strictly sequential.
//! 3. A missing token ends the walk. Missing on page one means zero groups matched.
//! 4. No retries. A failed request is fatal for the partition and propagates as `Err`.
//!
//! 🦆 The duck pages sequentially too. It has no choice. The token said so.

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::backends::QuerySource;
use crate::common::{ContinuationToken, Group, KeyValue};

/// 🎯 A single predicate inside a filtered count.
///
/// ⚠️ `LessThan` and `GreaterThan` are strict. A value of exactly `0` matches neither
/// `< 0` nor `> 0`, so it lands in no delay bucket at all. That gap is intentional and
/// covered by tests; don't "fix" it with `<=` unless the reports are meant to change.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Term { field: String, value: KeyValue },
    LessThan { field: String, value: f64 },
    GreaterThan { field: String, value: f64 },
}

impl Predicate {
    /// 🔍 Evaluate against one source document. Missing fields never match.
    pub fn matches(&self, document: &Map<String, Value>) -> bool {
        match self {
            Predicate::Term { field, value } => document
                .get(field)
                .and_then(KeyValue::from_json)
                .is_some_and(|found| found.matches(value)),
            Predicate::LessThan { field, value } => numeric_field(document, field)
                .is_some_and(|found| found < *value),
            Predicate::GreaterThan { field, value } => numeric_field(document, field)
                .is_some_and(|found| found > *value),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Predicate::Term { field, .. }
            | Predicate::LessThan { field, .. }
            | Predicate::GreaterThan { field, .. } => field,
        }
    }
}

fn numeric_field(document: &Map<String, Value>, field: &str) -> Option<f64> {
    document
        .get(field)
        .and_then(KeyValue::from_json)
        .and_then(|value| value.to_float())
}

/// 📊 What to compute inside each group.
#[derive(Debug, Clone, PartialEq)]
pub enum SubAggregationKind {
    /// 🧮 Count of documents matching every predicate.
    FilterCount(Vec<Predicate>),
    /// ➗ Average of `field`; documents without it count as `missing`.
    Avg { field: String, missing: f64 },
    /// ➕ Sum of `field`; documents without it count as `missing`.
    Sum { field: String, missing: f64 },
    /// 📄 Top `size` documents, projected to `includes`.
    TopSample { size: usize, includes: Vec<String> },
}

/// 🏷️ A named sub-aggregation. The name is how the result is found in each group.
#[derive(Debug, Clone, PartialEq)]
pub struct SubAggregation {
    pub name: String,
    pub kind: SubAggregationKind,
}

/// 📜 Everything a single grouped-aggregation request needs, minus the token.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedQuery {
    /// 📦 Source collection (index) to aggregate over.
    pub collection: String,
    /// 🎯 Exact-match predicates, typically the partition fields.
    pub filter: Vec<(String, KeyValue)>,
    /// 🔑 Grouping fields. Order defines key order in every returned group.
    pub grouping_fields: Vec<String>,
    pub sub_aggregations: Vec<SubAggregation>,
    /// 📏 Upper bound on groups per page, not a promise.
    pub page_size: usize,
}

impl GroupedQuery {
    /// 🔍 Does `document` pass the exact-match filter?
    pub fn filter_matches(&self, document: &Map<String, Value>) -> bool {
        self.filter.iter().all(|(field, value)| {
            Predicate::Term {
                field: field.clone(),
                value: value.clone(),
            }
            .matches(document)
        })
    }
}

/// 🧭 Lazy, finite walk over the pages of one grouped query.
///
/// Borrowing the source keeps the cursor scoped to one partition's pipeline; the source
/// itself is shared (read-only) across partitions.
#[derive(Debug)]
pub struct GroupedQueryCursor<'a, S: QuerySource + ?Sized> {
    source: &'a S,
    query: GroupedQuery,
    token: Option<ContinuationToken>,
    exhausted: bool,
    pages_fetched: usize,
}

impl<'a, S: QuerySource + ?Sized> GroupedQueryCursor<'a, S> {
    /// 🚀 Open a cursor. No request is made until the first `next_page`.
    pub fn open(source: &'a S, query: GroupedQuery) -> Self {
        Self {
            source,
            query,
            token: None,
            exhausted: false,
            pages_fetched: 0,
        }
    }

    /// 📡 Fetch the next page of groups, or `Ok(None)` once the token has run out.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Group>>> {
        if self.exhausted {
            return Ok(None);
        }

        trace!(
            "📡 fetching page {} of '{}' (token present: {})",
            self.pages_fetched + 1,
            self.query.collection,
            self.token.is_some()
        );
        let page = self
            .source
            .query(&self.query, self.token.as_ref())
            .await
            .with_context(|| {
                format!(
                    "💀 Grouped query against '{}' failed on page {}. No retries, no partial resume. The partition is toast; its siblings carry on.",
                    self.query.collection,
                    self.pages_fetched + 1
                )
            })?;
        self.pages_fetched += 1;

        match page.next_token {
            Some(next) => {
                // 🔒 A token that doesn't move would page forever. We'd rather scream.
                if self.token.as_ref() == Some(&next) {
                    bail!(
                        "💀 The continuation token for '{}' did not advance after page {}. The cursor refuses to loop until the heat death of the universe.",
                        self.query.collection,
                        self.pages_fetched
                    );
                }
                self.token = Some(next);
            }
            None => {
                self.exhausted = true;
                self.token = None;
            }
        }

        debug!(
            "📃 page {} of '{}' brought {} groups{}",
            self.pages_fetched,
            self.query.collection,
            page.groups.len(),
            if self.exhausted { " (last one)" } else { "" }
        );
        Ok(Some(page.groups))
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::InMemorySource;
    use crate::common::GroupPage;
    use serde_json::json;

    fn the_query() -> GroupedQuery {
        GroupedQuery {
            collection: "on_time_data".to_string(),
            filter: vec![
                ("year".to_string(), KeyValue::Int(2020)),
                ("month".to_string(), KeyValue::Int(1)),
            ],
            grouping_fields: vec!["reporting_airline".to_string()],
            sub_aggregations: vec![],
            page_size: 2,
        }
    }

    fn a_group(carrier: &str) -> Group {
        Group {
            key: vec![("reporting_airline".to_string(), KeyValue::Str(carrier.to_string()))],
            doc_count: 1,
            ..Group::default()
        }
    }

    #[tokio::test]
    async fn the_one_where_the_token_vanishes_on_page_two_and_the_cursor_stops() -> Result<()> {
        let the_source = InMemorySource::scripted(vec![
            GroupPage {
                groups: vec![a_group("AA"), a_group("DL")],
                next_token: Some(ContinuationToken(json!({"reporting_airline": "DL"}))),
            },
            GroupPage {
                groups: vec![a_group("UA")],
                next_token: None,
            },
        ]);

        let mut cursor = GroupedQueryCursor::open(&the_source, the_query());
        let mut seen = Vec::new();
        while let Some(groups) = cursor.next_page().await? {
            seen.extend(groups);
        }

        assert_eq!(cursor.pages_fetched(), 2);
        assert_eq!(seen.len(), 3);
        assert_eq!(the_source.request_count().await, 2, "exactly two requests, not a third for luck");

        // 🎟️ first request had no token, second echoed page one's token
        let tokens = the_source.received_tokens().await;
        assert_eq!(tokens[0], None);
        assert_eq!(
            tokens[1],
            Some(ContinuationToken(json!({"reporting_airline": "DL"})))
        );

        // 💤 an exhausted cursor stays exhausted and makes no further calls
        assert!(cursor.next_page().await?.is_none());
        assert_eq!(the_source.request_count().await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_page_one_has_no_token_and_nothing_matched() -> Result<()> {
        let the_source = InMemorySource::scripted(vec![GroupPage::default()]);
        let mut cursor = GroupedQueryCursor::open(&the_source, the_query());

        let first = cursor.next_page().await?;
        assert_eq!(first, Some(vec![]));
        assert!(cursor.next_page().await?.is_none());
        assert_eq!(cursor.pages_fetched(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_page_fetch_fails_and_nobody_retries() -> Result<()> {
        let the_source = InMemorySource::scripted(vec![
            GroupPage {
                groups: vec![a_group("AA")],
                next_token: Some(ContinuationToken(json!({"k": 1}))),
            },
            GroupPage::default(),
        ])
        .failing_on_request(2);

        let mut cursor = GroupedQueryCursor::open(&the_source, the_query());
        assert!(cursor.next_page().await?.is_some());
        let the_error = cursor.next_page().await.expect_err("page two was scripted to explode");
        assert!(format!("{the_error:#}").contains("page 2"));
        assert_eq!(the_source.request_count().await, 2, "one failure, zero retries");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_token_refuses_to_move_and_we_refuse_to_loop() -> Result<()> {
        let stuck = ContinuationToken(json!({"k": "same"}));
        let the_source = InMemorySource::scripted(vec![
            GroupPage {
                groups: vec![a_group("AA")],
                next_token: Some(stuck.clone()),
            },
            GroupPage {
                groups: vec![a_group("AA")],
                next_token: Some(stuck),
            },
        ]);

        let mut cursor = GroupedQueryCursor::open(&the_source, the_query());
        assert!(cursor.next_page().await?.is_some());
        assert!(cursor.next_page().await.is_err());
        Ok(())
    }

    #[test]
    fn the_one_where_zero_is_neither_early_nor_late() {
        let on_time = json!({"dep_delay": 0}).as_object().cloned().unwrap_or_default();
        let early = Predicate::LessThan { field: "dep_delay".into(), value: 0.0 };
        let late = Predicate::GreaterThan { field: "dep_delay".into(), value: 0.0 };
        assert!(!early.matches(&on_time));
        assert!(!late.matches(&on_time));

        let missing = Map::new();
        assert!(!early.matches(&missing), "missing fields never match");
    }

    #[test]
    fn the_one_where_the_filter_wants_exact_matches_only() {
        let query = the_query();
        let doc = json!({"year": 2020, "month": 1.0}).as_object().cloned().unwrap_or_default();
        let wrong_month = json!({"year": 2020, "month": 2}).as_object().cloned().unwrap_or_default();
        assert!(query.filter_matches(&doc));
        assert!(!query.filter_matches(&wrong_month));
    }
}
