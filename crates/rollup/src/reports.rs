//! 📊 Reports: what to group, what to count, and what the finished record looks like.
//!
//! Every report is plain data: a [`ReportSpec`]. One generic pipeline runs all of them.
//! Adding a report means adding a value to the catalog, not copying a pipeline and
//! changing three field names (and forgetting the fourth).
//!
//! A report definition says:
//! - where groups come from (`source_collection`, the partition kind, `grouping`),
//! - what to compute per group (`sub_aggregations`),
//! - how each output field is derived (`outputs`, a small expression vocabulary),
//! - which fields make the deterministic identifier (`id_fields`),
//! - and where the records go (`destination_collection`, with an optional `mapping`).
//!
//! [`ReportSpec::validate`] refuses specs that could produce colliding identifiers across
//! partitions, or that reference sub-aggregations that don't exist. It runs before the
//! first query.

use std::collections::HashSet;

use anyhow::{Result, bail};
use serde_json::Value;

use crate::common::{FieldType, Partition, PartitionKind};
use crate::cursor::{GroupedQuery, SubAggregation, SubAggregationKind};

pub mod catalog;

/// 🔑 One grouping field and the type its values are coerced into.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyField {
    pub field: String,
    pub field_type: FieldType,
}

/// 📍 Where a raw value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRef {
    /// A partition field, by name (`year`, `month`, `quarter`).
    Partition(String),
    /// A grouping key, by source field name, already coerced to its declared type.
    Key(String),
    /// A field of the group's sample document. May be absent.
    Sample(String),
}

/// 🧮 How one output field is computed.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    /// The referenced value, coerced to `field_type`. Absent sample fields get the type's default.
    Value { from: FieldRef, field_type: FieldType },
    /// The group's document count.
    DocCount,
    /// A filtered-count sub-aggregation, by name. Absent → 0.
    Count(String),
    /// An avg/sum sub-aggregation, by name. A null result takes the aggregation's `missing`.
    Metric { aggregation: String, field_type: FieldType },
    /// Split the value's text on `separator` and keep part `index`. No such part → "".
    SplitPart { from: FieldRef, separator: String, index: usize },
    /// Look the value's text up in a name table. A miss → "".
    Lookup { table: String, from: FieldRef },
    /// True only when every value is flagged true in the flag table. A miss counts as false.
    AllFlags { table: String, from: Vec<FieldRef> },
    /// True when any value is flagged true in the flag table.
    AnyFlag { table: String, from: Vec<FieldRef> },
    /// The values' texts, concatenated.
    Concat(Vec<FieldRef>),
}

impl OutputValue {
    fn refs(&self) -> Vec<&FieldRef> {
        match self {
            OutputValue::Value { from, .. }
            | OutputValue::SplitPart { from, .. }
            | OutputValue::Lookup { from, .. } => vec![from],
            OutputValue::AllFlags { from, .. }
            | OutputValue::AnyFlag { from, .. }
            | OutputValue::Concat(from) => from.iter().collect(),
            OutputValue::DocCount | OutputValue::Count(_) | OutputValue::Metric { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputField {
    pub name: String,
    pub value: OutputValue,
}

/// 📜 A whole report, declared.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportSpec {
    pub name: String,
    pub source_collection: String,
    pub destination_collection: String,
    pub partition_kind: PartitionKind,
    /// 🔑 Grouping fields, in key order.
    pub grouping: Vec<KeyField>,
    pub sub_aggregations: Vec<SubAggregation>,
    pub outputs: Vec<OutputField>,
    /// 🪪 Identifier parts, in order, joined with `_`.
    pub id_fields: Vec<FieldRef>,
    /// 📄 When set, a group without a sample document is skipped instead of built.
    pub sample_required: bool,
    /// 📏 Overrides the source's default page size.
    pub page_size: Option<usize>,
    /// 🏗️ Index body used when the destination has to be created.
    pub mapping: Option<Value>,
}

impl ReportSpec {
    pub fn grouping_fields(&self) -> Vec<String> {
        self.grouping.iter().map(|key| key.field.clone()).collect()
    }

    pub fn key_field(&self, field: &str) -> Option<&KeyField> {
        self.grouping.iter().find(|key| key.field == field)
    }

    pub fn sub_aggregation(&self, name: &str) -> Option<&SubAggregation> {
        self.sub_aggregations.iter().find(|agg| agg.name == name)
    }

    /// 🪪 The source field name each identifier part stands for.
    fn id_field_name(field_ref: &FieldRef) -> Option<&str> {
        match field_ref {
            FieldRef::Partition(name) | FieldRef::Key(name) => Some(name),
            FieldRef::Sample(_) => None,
        }
    }

    /// 🔒 Checks that hold for every partition, so they're checked once, up front:
    /// - the identifier is built only from partition fields and grouping keys (never metrics
    ///   or sample fields), and names every partition field, so two partitions can never
    ///   derive the same identifier;
    /// - every referenced grouping key, sub-aggregation and partition field exists;
    /// - output names are unique;
    /// - a report that requires a sample actually asks for one.
    pub fn validate(&self) -> Result<()> {
        if self.grouping.is_empty() {
            bail!("💀 Report '{}' groups by nothing. That's a count, not a report.", self.name);
        }
        if self.id_fields.is_empty() {
            bail!("💀 Report '{}' has no identifier fields. Every rerun would be a duplicate.", self.name);
        }

        let partition_fields = self.partition_kind.field_names();
        for field_ref in self.id_fields.iter().chain(self.outputs.iter().flat_map(|o| o.value.refs())) {
            match field_ref {
                FieldRef::Partition(name) if !partition_fields.contains(&name.as_str()) => bail!(
                    "💀 Report '{}' references partition field '{}', but its partitions only have {:?}.",
                    self.name,
                    name,
                    partition_fields
                ),
                FieldRef::Key(name) if self.key_field(name).is_none() => bail!(
                    "💀 Report '{}' references key '{}', which it doesn't group by.",
                    self.name,
                    name
                ),
                _ => {}
            }
        }

        let id_names: Vec<&str> = self
            .id_fields
            .iter()
            .map(|field_ref| {
                Self::id_field_name(field_ref).ok_or_else(|| {
                    anyhow::anyhow!(
                        "💀 Report '{}' builds its identifier from a sample field. Samples are not keys; the identifier would wander.",
                        self.name
                    )
                })
            })
            .collect::<Result<_>>()?;
        for partition_field in partition_fields {
            if !id_names.contains(partition_field) {
                bail!(
                    "💀 Report '{}' leaves partition field '{}' out of its identifier. Two partitions could overwrite each other.",
                    self.name,
                    partition_field
                );
            }
        }

        let mut seen = HashSet::new();
        for output in &self.outputs {
            if !seen.insert(output.name.as_str()) {
                bail!("💀 Report '{}' declares output '{}' twice.", self.name, output.name);
            }
            match &output.value {
                OutputValue::Count(name) => match self.sub_aggregation(name).map(|agg| &agg.kind) {
                    Some(SubAggregationKind::FilterCount(_)) => {}
                    _ => bail!("💀 Report '{}' output '{}' counts '{}', which is not a filtered count it declares.", self.name, output.name, name),
                },
                OutputValue::Metric { aggregation, .. } => match self.sub_aggregation(aggregation).map(|agg| &agg.kind) {
                    Some(SubAggregationKind::Avg { .. } | SubAggregationKind::Sum { .. }) => {}
                    _ => bail!("💀 Report '{}' output '{}' reads metric '{}', which is not an avg or sum it declares.", self.name, output.name, aggregation),
                },
                _ => {}
            }
        }

        let samples = self
            .sub_aggregations
            .iter()
            .any(|agg| matches!(agg.kind, SubAggregationKind::TopSample { .. }));
        if self.sample_required && !samples {
            bail!("💀 Report '{}' requires a sample document but never asks for one.", self.name);
        }
        Ok(())
    }

    /// 📜 The grouped query for one partition of this report.
    pub fn grouped_query(&self, partition: &Partition, default_page_size: usize) -> GroupedQuery {
        GroupedQuery {
            collection: self.source_collection.clone(),
            filter: partition.fields(),
            grouping_fields: self.grouping_fields(),
            sub_aggregations: self.sub_aggregations.clone(),
            page_size: self.page_size.unwrap_or(default_page_size),
        }
    }

    /// 🏷️ Does this report run over this partition? Monthly reports skip quarters and vice versa.
    pub fn accepts(&self, partition: &Partition) -> bool {
        partition.kind() == self.partition_kind
    }
}
