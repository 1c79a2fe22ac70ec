//! 🏗️ Record Builder: one group in, one flat record out.
//!
//! A pure function of (report, partition, group, reference data). No I/O, no clocks, no
//! hidden state. Same inputs, same record, same identifier, every time.
//!
//! Resolution rules:
//! - grouping keys are coerced to their declared type; a key that is missing or can't be
//!   represented (`"ORD"` as an integer) is an `Err`. That's a schema problem and it fails
//!   the partition;
//! - filtered counts default to 0; avg/sum results that come back null take the
//!   aggregation's declared `missing` value;
//! - sample fields that aren't there resolve to the type's default;
//! - reference lookups that miss resolve to `""` / `false`. Enrichment is best-effort.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Number, Value};

use crate::common::{FieldType, Group, KeyValue, OutputRecord, Partition, SubAggregationValue, json_text};
use crate::cursor::SubAggregationKind;
use crate::reference::ReferenceData;
use crate::reports::{FieldRef, OutputValue, ReportSpec};

/// 🧾 What the builder made of a group.
#[derive(Debug, Clone, PartialEq)]
pub enum Built {
    Record(OutputRecord),
    /// The group can't produce a record (required sample missing). Carries the reason.
    Skipped(String),
}

/// 🏗️ Builds records for one report. Cheap to clone; shares the report definition and reference data.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    report: Arc<ReportSpec>,
    reference: Arc<ReferenceData>,
}

/// 🔧 Everything one output field may read from, resolved once per group.
struct Scope<'a> {
    partition: &'a Partition,
    keys: HashMap<&'a str, Value>,
    group: &'a Group,
}

impl Scope<'_> {
    fn resolve(&self, field_ref: &FieldRef) -> Option<Value> {
        match field_ref {
            FieldRef::Partition(name) => self.partition.value_of(name).map(|v| v.to_json()),
            FieldRef::Key(name) => self.keys.get(name.as_str()).cloned(),
            FieldRef::Sample(name) => self
                .group
                .sample
                .as_ref()
                .and_then(|sample| sample.get(name))
                .filter(|value| !value.is_null())
                .cloned(),
        }
    }

    fn text(&self, field_ref: &FieldRef) -> String {
        self.resolve(field_ref).as_ref().map(json_text).unwrap_or_default()
    }
}

fn default_for(field_type: FieldType) -> Value {
    match field_type {
        FieldType::Text => Value::String(String::new()),
        FieldType::Integer => Value::from(0),
        FieldType::Float => Value::from(0.0),
        FieldType::Boolean => Value::Bool(false),
    }
}

fn metric_value(value: f64, field_type: FieldType) -> Value {
    match field_type {
        // 🔢 truncation, same as casting a float total to an int count
        FieldType::Integer => Value::from(value as i64),
        FieldType::Float => Number::from_f64(value).map(Value::Number).unwrap_or_else(|| Value::from(0.0)),
        FieldType::Text => Value::String(KeyValue::Float(value).to_text()),
        FieldType::Boolean => Value::Bool(value != 0.0),
    }
}

impl RecordBuilder {
    pub fn new(report: Arc<ReportSpec>, reference: Arc<ReferenceData>) -> Self {
        Self { report, reference }
    }

    pub fn report(&self) -> &ReportSpec {
        &self.report
    }

    /// 🏗️ Build the record for `group` within `partition`.
    pub fn build(&self, partition: &Partition, group: &Group) -> Result<Built> {
        let report = &*self.report;

        if report.sample_required && group.sample.is_none() {
            return Ok(Built::Skipped(format!(
                "no sample document for group {}",
                group
                    .key
                    .iter()
                    .map(|(field, value)| format!("{field}={}", value.to_text()))
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let mut keys = HashMap::with_capacity(report.grouping.len());
        for key_field in &report.grouping {
            let raw = group.key_value(&key_field.field).with_context(|| {
                format!(
                    "💀 Report '{}': group is missing grouping key '{}'. The engine sent a bucket with a hole in it.",
                    report.name, key_field.field
                )
            })?;
            let coerced = key_field.field_type.coerce(raw).with_context(|| {
                format!(
                    "💀 Report '{}': key '{}' = {:?} is not a valid {:?}. The data and the report disagree about types.",
                    report.name, key_field.field, raw, key_field.field_type
                )
            })?;
            keys.insert(key_field.field.as_str(), coerced);
        }

        let scope = Scope { partition, keys, group };

        let id = report
            .id_fields
            .iter()
            .map(|field_ref| scope.text(field_ref))
            .collect::<Vec<_>>()
            .join("_");

        let mut fields = Map::with_capacity(report.outputs.len());
        for output in &report.outputs {
            fields.insert(output.name.clone(), self.evaluate(&scope, &output.value));
        }

        Ok(Built::Record(OutputRecord {
            id,
            collection: report.destination_collection.clone(),
            fields,
        }))
    }

    fn evaluate(&self, scope: &Scope<'_>, value: &OutputValue) -> Value {
        match value {
            OutputValue::Value { from, field_type } => scope
                .resolve(from)
                .and_then(|raw| KeyValue::from_json(&raw))
                .and_then(|key| field_type.coerce(&key))
                .unwrap_or_else(|| default_for(*field_type)),
            OutputValue::DocCount => Value::from(scope.group.doc_count),
            OutputValue::Count(name) => match scope.group.sub_aggregation(name) {
                Some(SubAggregationValue::Count(count)) => Value::from(*count),
                _ => Value::from(0),
            },
            OutputValue::Metric { aggregation, field_type } => {
                let missing = match self.report.sub_aggregation(aggregation).map(|agg| &agg.kind) {
                    Some(SubAggregationKind::Avg { missing, .. } | SubAggregationKind::Sum { missing, .. }) => *missing,
                    _ => 0.0,
                };
                let resolved = match scope.group.sub_aggregation(aggregation) {
                    Some(SubAggregationValue::Metric(Some(value))) => *value,
                    _ => missing,
                };
                metric_value(resolved, *field_type)
            }
            OutputValue::SplitPart { from, separator, index } => Value::String(
                scope
                    .text(from)
                    .split(separator.as_str())
                    .nth(*index)
                    .unwrap_or_default()
                    .to_string(),
            ),
            OutputValue::Lookup { table, from } => Value::String(
                self.reference
                    .name(table, &scope.text(from))
                    .unwrap_or_default()
                    .to_string(),
            ),
            OutputValue::AllFlags { table, from } => Value::Bool(
                from.iter()
                    .all(|field_ref| self.reference.flag(table, &scope.text(field_ref)).unwrap_or(false)),
            ),
            OutputValue::AnyFlag { table, from } => Value::Bool(
                from.iter()
                    .any(|field_ref| self.reference.flag(table, &scope.text(field_ref)).unwrap_or(false)),
            ),
            OutputValue::Concat(parts) => {
                Value::String(parts.iter().map(|field_ref| scope.text(field_ref)).collect())
            }
        }
    }
}
