//! 📦 Common data structures: the building blocks of rollup
//!
//! 🎬 COLD OPEN: INT. DATA CENTER: 3:47 AM
//!
//! Two hundred million flight rows sit in an index. Nobody wants two hundred
//! million rows. Somebody wants one number per airline per month. The cluster
//! groups, the cursor pages, and every page arrives as a pile of [`Group`]s
//! that have no idea what shape their keys are in. Some keys are strings. Some
//! are integers. Some are integers pretending to be floats (`2020.0`, we see you).
//!
//! This module defines the humble, load-bearing types that carry data from the
//! aggregation engine to the document store:
//!
//! - [`Partition`]: the unit of work (`year+month` or `year+quarter`)
//! - [`KeyValue`]: the tagged union that makes heterogeneous keys behave
//! - [`Group`] / [`GroupPage`] / [`ContinuationToken`]: what the cursor yields
//! - [`OutputRecord`]: what the sink writes
//! - [`BulkItemFailure`]: what the sink whispers when a write goes sideways
//!
//! 🦆

use std::collections::HashMap;
use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================
// 📅 Partition: the unit of work
// ============================================================

/// 📅 One unit of pipeline work. Immutable. Created from config, consumed once per pass.
///
/// Deserializes from either `{ year, month }` or `{ year, quarter }`. Untagged because
/// nobody wants to write `kind = "monthly"` in a TOML file forty times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Partition {
    Monthly { year: i32, month: u8 },
    Quarterly { year: i32, quarter: u8 },
}

/// 🏷️ Which flavor of partition a report wants. Monthly reports ignore quarterly partitions
/// and vice versa. Like a bouncer who checks the calendar instead of the ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
    Monthly,
    Quarterly,
}

impl PartitionKind {
    /// 🧾 The field names a partition of this kind filters on, in identifier order.
    pub fn field_names(&self) -> &'static [&'static str] {
        match self {
            PartitionKind::Monthly => &["year", "month"],
            PartitionKind::Quarterly => &["year", "quarter"],
        }
    }
}

impl Partition {
    pub fn kind(&self) -> PartitionKind {
        match self {
            Partition::Monthly { .. } => PartitionKind::Monthly,
            Partition::Quarterly { .. } => PartitionKind::Quarterly,
        }
    }

    /// 🎯 The exact-match predicates this partition contributes to every query, in order.
    pub fn fields(&self) -> Vec<(String, KeyValue)> {
        match *self {
            Partition::Monthly { year, month } => vec![
                ("year".to_string(), KeyValue::Int(year as i64)),
                ("month".to_string(), KeyValue::Int(month as i64)),
            ],
            Partition::Quarterly { year, quarter } => vec![
                ("year".to_string(), KeyValue::Int(year as i64)),
                ("quarter".to_string(), KeyValue::Int(quarter as i64)),
            ],
        }
    }

    /// 🔍 Look up a single partition field by name. `None` if this partition doesn't have it.
    pub fn value_of(&self, field: &str) -> Option<KeyValue> {
        self.fields()
            .into_iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    /// 🔒 Month 13 is not a month. Quarter 0 is not a quarter. We check before we query.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Partition::Monthly { month, .. } if !(1..=12).contains(&month) => bail!(
                "💀 Partition {} has month {}, which is not one of the twelve months we have agreed upon as a species.",
                self,
                month
            ),
            Partition::Quarterly { quarter, .. } if !(1..=4).contains(&quarter) => bail!(
                "💀 Partition {} has quarter {}. Quarters go 1 through 4. Fiscal creativity is not supported.",
                self,
                quarter
            ),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Monthly { year, month } => write!(f, "{year}-{month:02}"),
            Partition::Quarterly { year, quarter } => write!(f, "{year}-Q{quarter}"),
        }
    }
}

// ============================================================
// 🔑 KeyValue: the tagged union for heterogeneous keys
// ============================================================

/// 🔑 A scalar that came back from the aggregation engine and refuses to commit to a type.
///
/// The server hands us `2020`, `2020.0`, `"2020"` and `true` with equal enthusiasm.
/// We resolve them once, explicitly, through the `to_*` conversions below. Every variant
/// is handled by every conversion; the `Option` says "not representable", never "panic".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum KeyValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl KeyValue {
    /// 📡 Lift a JSON scalar into a `KeyValue`. Arrays, objects, and null get `None`.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(KeyValue::Str(s.clone())),
            Value::Bool(b) => Some(KeyValue::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(KeyValue::Int)
                .or_else(|| n.as_f64().map(KeyValue::Float)),
            _ => None,
        }
    }

    /// 📦 Back to JSON. Non-finite floats become null because JSON has no NaN and no sense of humor.
    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::Str(s) => Value::String(s.clone()),
            KeyValue::Int(i) => Value::from(*i),
            KeyValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            KeyValue::Bool(b) => Value::Bool(*b),
        }
    }

    /// 🧵 Text form. Whole floats print without the `.0` so `2020.0` and `2020` agree.
    pub fn to_text(&self) -> String {
        match self {
            KeyValue::Str(s) => s.clone(),
            KeyValue::Int(i) => i.to_string(),
            KeyValue::Float(f) => match whole_float_as_i64(*f) {
                Some(i) => i.to_string(),
                None => f.to_string(),
            },
            KeyValue::Bool(b) => b.to_string(),
        }
    }

    pub fn to_int(&self) -> Option<i64> {
        match self {
            KeyValue::Str(s) => {
                let trimmed = s.trim();
                trimmed
                    .parse::<i64>()
                    .ok()
                    .or_else(|| trimmed.parse::<f64>().ok().and_then(whole_float_as_i64))
            }
            KeyValue::Int(i) => Some(*i),
            KeyValue::Float(f) => whole_float_as_i64(*f),
            KeyValue::Bool(b) => Some(i64::from(*b)),
        }
    }

    pub fn to_float(&self) -> Option<f64> {
        match self {
            KeyValue::Str(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            KeyValue::Int(i) => Some(*i as f64),
            KeyValue::Float(f) => Some(*f).filter(|f| f.is_finite()),
            KeyValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        }
    }

    pub fn to_bool(&self) -> Option<bool> {
        match self {
            KeyValue::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            KeyValue::Int(0) => Some(false),
            KeyValue::Int(1) => Some(true),
            KeyValue::Int(_) => None,
            KeyValue::Float(f) if *f == 0.0 => Some(false),
            KeyValue::Float(f) if *f == 1.0 => Some(true),
            KeyValue::Float(_) => None,
            KeyValue::Bool(b) => Some(*b),
        }
    }

    /// ⚖️ Term-query equality: text compares as text, everything else compares numerically.
    /// `cancelled: 0` matches a stored `0.0`, because the index doesn't care and neither do we.
    pub fn matches(&self, other: &KeyValue) -> bool {
        match (self, other) {
            (KeyValue::Str(a), KeyValue::Str(b)) => a == b,
            (KeyValue::Str(_), _) | (_, KeyValue::Str(_)) => self.to_text() == other.to_text(),
            _ => match (self.to_float(), other.to_float()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

// 🔢 2^53: past this, f64 stops being able to count. So do we.
fn whole_float_as_i64(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f.abs() <= 9_007_199_254_740_992.0 {
        Some(f as i64)
    } else {
        None
    }
}

/// 🏷️ The type an output field is declared as. The builder coerces keys into one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Boolean,
}

impl FieldType {
    /// 🔄 Coerce a key into this declared type. `None` means the value cannot be represented,
    /// e.g. `"ORD"` as an integer. That's a schema problem, not a rounding problem.
    pub fn coerce(&self, value: &KeyValue) -> Option<Value> {
        match self {
            FieldType::Text => Some(Value::String(value.to_text())),
            FieldType::Integer => value.to_int().map(Value::from),
            FieldType::Float => value
                .to_float()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            FieldType::Boolean => value.to_bool().map(Value::Bool),
        }
    }
}

/// 🧵 Text form of an already-shaped JSON scalar. Null and structures become "".
pub(crate) fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(_) | Value::Bool(_) => {
            KeyValue::from_json(value).map(|k| k.to_text()).unwrap_or_default()
        }
        _ => String::new(),
    }
}

// ============================================================
// 📊 Group: one server-side bucket
// ============================================================

/// 📊 A resolved sub-aggregation. Counts come from filter buckets; metrics from avg/sum,
/// where `None` is the engine saying "no documents had a value" (handled by the builder).
#[derive(Debug, Clone, PartialEq)]
pub enum SubAggregationValue {
    Count(u64),
    Metric(Option<f64>),
}

/// 📊 One grouping-key tuple plus its doc count, sub-aggregations, and optional sample doc.
///
/// Produced per page, consumed immediately, never retained. The mayfly of data structures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Group {
    /// 🔑 Key fields in grouping order.
    pub key: Vec<(String, KeyValue)>,
    pub doc_count: u64,
    pub sub_aggregations: HashMap<String, SubAggregationValue>,
    /// 📄 The top-hit sample document, projected to the requested fields.
    pub sample: Option<Map<String, Value>>,
}

impl Group {
    pub fn key_value(&self, field: &str) -> Option<&KeyValue> {
        self.key
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    pub fn sub_aggregation(&self, name: &str) -> Option<&SubAggregationValue> {
        self.sub_aggregations.get(name)
    }
}

/// 🎟️ Opaque continuation token. The cursor echoes it back and never looks inside.
/// Like a coat check ticket. You don't read it. You hand it back.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationToken(pub(crate) Value);

/// 📃 One page of groups plus the token for the next page (`None` = that was the last one).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupPage {
    pub groups: Vec<Group>,
    pub next_token: Option<ContinuationToken>,
}

// ============================================================
// 📝 OutputRecord + BulkItemFailure: the write side
// ============================================================

/// 📝 A flat business record, addressed by a deterministic identifier.
///
/// Same partition, same keys → same `id`. The store overwrites, never appends.
/// Rerun it a hundred times; you get the same documents, just fresher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputRecord {
    pub id: String,
    pub collection: String,
    pub fields: Map<String, Value>,
}

/// 💀 Diagnostic detail for one record the store refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemFailure {
    pub collection: String,
    pub id: String,
    /// 📡 Per-item status. `0` when the whole request never got an answer.
    pub status: u16,
    pub error: String,
}

impl fmt::Display for BulkItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "index:{} id:{} status:{} error:{}",
            self.collection, self.id, self.status, self.error
        )
    }
}
