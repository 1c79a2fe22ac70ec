//! 📚 The report catalog: six reports over the on-time and market data, declared as values.
//!
//! | report | partition | groups by | identifier |
//! |---|---|---|---|
//! | `air_carrier_flight_report` | year, month | carrier | year, month, carrier |
//! | `origin_airport_flight_report` | year, month | carrier, origin | year, month, carrier, origin |
//! | `dest_airport_flight_report` | year, month | carrier, dest | year, month, carrier, dest |
//! | `flight_cancel_data_report` | year, month | carrier, tail number | year, month, carrier, tail number |
//! | `airlines` | year, month | route + flight number | year, month, origin, dest, carrier, flight number |
//! | `airport_flights` | year, quarter | origin, dest | year, quarter, origin, dest |
//!
//! Delay buckets use strict comparisons, so a delay of exactly zero is neither early nor
//! delayed. Those flights still count towards `flight_count`.

use anyhow::{Result, bail};
use serde_json::{Value, json};

use super::{FieldRef, KeyField, OutputField, OutputValue, ReportSpec};
use crate::common::{FieldType, KeyValue, PartitionKind};
use crate::cursor::{Predicate, SubAggregation, SubAggregationKind};

pub const ON_TIME_DATA: &str = "on_time_data";
pub const MARKETS: &str = "markets";

pub const AIRPORTS_TABLE: &str = "airports";
pub const CARRIERS_TABLE: &str = "carriers";
pub const CITY_MARKETS_TABLE: &str = "city_markets";
pub const DOMESTIC_MARKETS_TABLE: &str = "domestic_markets";

// ===== tiny constructors, so the specs below read like tables =====

fn key(field: &str, field_type: FieldType) -> KeyField {
    KeyField {
        field: field.to_string(),
        field_type,
    }
}

fn out(name: &str, value: OutputValue) -> OutputField {
    OutputField {
        name: name.to_string(),
        value,
    }
}

fn from_key(field: &str, field_type: FieldType) -> OutputValue {
    OutputValue::Value {
        from: FieldRef::Key(field.to_string()),
        field_type,
    }
}

fn from_sample(field: &str) -> OutputValue {
    OutputValue::Value {
        from: FieldRef::Sample(field.to_string()),
        field_type: FieldType::Text,
    }
}

fn from_partition(field: &str) -> OutputValue {
    OutputValue::Value {
        from: FieldRef::Partition(field.to_string()),
        field_type: FieldType::Integer,
    }
}

fn count(name: &str) -> OutputValue {
    OutputValue::Count(name.to_string())
}

fn term(field: &str, value: KeyValue) -> Predicate {
    Predicate::Term {
        field: field.to_string(),
        value,
    }
}

fn filter_count(name: &str, predicates: Vec<Predicate>) -> SubAggregation {
    SubAggregation {
        name: name.to_string(),
        kind: SubAggregationKind::FilterCount(predicates),
    }
}

fn not_cancelled() -> Predicate {
    term("cancelled", KeyValue::Int(0))
}

fn ids(refs: &[FieldRef]) -> Vec<FieldRef> {
    refs.to_vec()
}

fn partition(field: &str) -> FieldRef {
    FieldRef::Partition(field.to_string())
}

fn key_ref(field: &str) -> FieldRef {
    FieldRef::Key(field.to_string())
}

fn sample_ref(field: &str) -> FieldRef {
    FieldRef::Sample(field.to_string())
}

/// ⏱️ Early / delayed / delayed-15 for departures and arrivals, plus cancellations.
fn delay_buckets() -> Vec<SubAggregation> {
    let mut buckets = Vec::new();
    for (leg, delay_field, del15_field) in [
        ("departure", "dep_delay", "dep_del15"),
        ("arrival", "arr_delay", "arr_del15"),
    ] {
        buckets.push(filter_count(
            &format!("early_{leg}_count"),
            vec![
                Predicate::LessThan { field: delay_field.to_string(), value: 0.0 },
                not_cancelled(),
            ],
        ));
        buckets.push(filter_count(
            &format!("delayed_{leg}_count"),
            vec![
                Predicate::GreaterThan { field: delay_field.to_string(), value: 0.0 },
                not_cancelled(),
            ],
        ));
        buckets.push(filter_count(
            &format!("delayed_15_{leg}_count"),
            vec![term(del15_field, KeyValue::Int(1)), not_cancelled()],
        ));
    }
    buckets.push(filter_count("cancelled_count", vec![term("cancelled", KeyValue::Int(1))]));
    buckets
}

fn delay_outputs() -> Vec<OutputField> {
    let mut outputs = vec![out("flight_count", OutputValue::DocCount)];
    outputs.extend(delay_buckets().into_iter().map(|agg| {
        let name = agg.name;
        out(&name, count(&name))
    }));
    outputs
}

fn integer_mapping(fields: &[&str]) -> serde_json::Map<String, Value> {
    fields
        .iter()
        .map(|field| (field.to_string(), json!({"type": "integer"})))
        .collect()
}

fn delay_mapping(keyword_fields: &[&str]) -> Value {
    let mut properties = integer_mapping(&[
        "flight_count",
        "early_departure_count",
        "delayed_departure_count",
        "delayed_15_departure_count",
        "early_arrival_count",
        "delayed_arrival_count",
        "delayed_15_arrival_count",
        "cancelled_count",
    ]);
    properties.insert("year".into(), json!({"type": "short"}));
    properties.insert("month".into(), json!({"type": "short"}));
    for field in keyword_fields {
        properties.insert(field.to_string(), json!({"type": "keyword"}));
    }
    json!({ "mappings": { "properties": properties } })
}

// ===== the reports =====

pub fn air_carrier_flight_report() -> ReportSpec {
    let mut outputs = vec![
        out("air_carrier", from_key("reporting_airline", FieldType::Text)),
        out("year", from_key("year", FieldType::Integer)),
        out("month", from_key("month", FieldType::Integer)),
    ];
    outputs.extend(delay_outputs());
    ReportSpec {
        name: "air_carrier_flight_report".into(),
        source_collection: ON_TIME_DATA.into(),
        destination_collection: "air_carrier_flight_report".into(),
        partition_kind: PartitionKind::Monthly,
        grouping: vec![
            key("year", FieldType::Integer),
            key("month", FieldType::Integer),
            key("reporting_airline", FieldType::Text),
        ],
        sub_aggregations: delay_buckets(),
        outputs,
        id_fields: ids(&[partition("year"), partition("month"), key_ref("reporting_airline")]),
        sample_required: false,
        page_size: None,
        mapping: Some(delay_mapping(&["air_carrier"])),
    }
}

fn airport_flight_report(name: &str, airport_field: &str) -> ReportSpec {
    let mut outputs = vec![
        out("airport", from_key(airport_field, FieldType::Text)),
        out("air_carrier", from_key("reporting_airline", FieldType::Text)),
        out("year", from_key("year", FieldType::Integer)),
        out("month", from_key("month", FieldType::Integer)),
    ];
    outputs.extend(delay_outputs());
    ReportSpec {
        name: name.into(),
        source_collection: ON_TIME_DATA.into(),
        destination_collection: name.into(),
        partition_kind: PartitionKind::Monthly,
        grouping: vec![
            key("year", FieldType::Integer),
            key("month", FieldType::Integer),
            key("reporting_airline", FieldType::Text),
            key(airport_field, FieldType::Text),
        ],
        sub_aggregations: delay_buckets(),
        outputs,
        id_fields: ids(&[
            partition("year"),
            partition("month"),
            key_ref("reporting_airline"),
            key_ref(airport_field),
        ]),
        sample_required: false,
        page_size: None,
        mapping: Some(delay_mapping(&["airport", "air_carrier"])),
    }
}

pub fn origin_airport_flight_report() -> ReportSpec {
    airport_flight_report("origin_airport_flight_report", "origin")
}

pub fn dest_airport_flight_report() -> ReportSpec {
    airport_flight_report("dest_airport_flight_report", "dest")
}

pub fn flight_cancel_data_report() -> ReportSpec {
    let reasons = [
        ("cancelled_carrier_count", "A"),
        ("cancelled_weather_count", "B"),
        ("cancelled_national_air_system_count", "C"),
        ("cancelled_security_count", "D"),
    ];
    let sub_aggregations: Vec<SubAggregation> = reasons
        .iter()
        .map(|(name, code)| {
            filter_count(
                name,
                vec![
                    term("cancelled", KeyValue::Int(1)),
                    term("cancellation_code", KeyValue::Str(code.to_string())),
                ],
            )
        })
        .collect();

    let mut outputs = vec![
        out("year", from_key("year", FieldType::Integer)),
        out("month", from_key("month", FieldType::Integer)),
        out("air_carrier", from_key("reporting_airline", FieldType::Text)),
        out("tail_number", from_key("tail_number", FieldType::Text)),
        out("flight_count", OutputValue::DocCount),
    ];
    outputs.extend(reasons.iter().map(|(name, _)| out(name, count(name))));

    let mut properties = integer_mapping(&["flight_count"]);
    properties.extend(integer_mapping(&reasons.map(|(name, _)| name)));
    properties.insert("year".into(), json!({"type": "short"}));
    properties.insert("month".into(), json!({"type": "short"}));
    properties.insert("air_carrier".into(), json!({"type": "keyword"}));
    properties.insert("tail_number".into(), json!({"type": "keyword"}));

    ReportSpec {
        name: "flight_cancel_data_report".into(),
        source_collection: ON_TIME_DATA.into(),
        destination_collection: "flight_cancel_data_report".into(),
        partition_kind: PartitionKind::Monthly,
        grouping: vec![
            key("year", FieldType::Integer),
            key("month", FieldType::Integer),
            key("reporting_airline", FieldType::Text),
            key("tail_number", FieldType::Text),
        ],
        sub_aggregations,
        outputs,
        id_fields: ids(&[
            partition("year"),
            partition("month"),
            key_ref("reporting_airline"),
            key_ref("tail_number"),
        ]),
        sample_required: false,
        page_size: None,
        mapping: Some(json!({ "mappings": { "properties": properties } })),
    }
}

/// ✈️ One record per flight number per route per month. City and state come from splitting
/// the sampled `"City, ST"` names; `domestic` needs both endpoints' markets flagged.
pub fn airlines() -> ReportSpec {
    let carrier = "iata_code_reporting_airline";
    let flight_number = "flight_number_reporting_airline";
    let split = |field: &str, index: usize| OutputValue::SplitPart {
        from: sample_ref(field),
        separator: ", ".to_string(),
        index,
    };

    ReportSpec {
        name: "airlines".into(),
        source_collection: ON_TIME_DATA.into(),
        destination_collection: "airlines".into(),
        partition_kind: PartitionKind::Monthly,
        grouping: vec![
            key("year", FieldType::Integer),
            key("month", FieldType::Integer),
            key("origin", FieldType::Text),
            key("dest", FieldType::Text),
            key(carrier, FieldType::Text),
            key(flight_number, FieldType::Text),
        ],
        sub_aggregations: vec![SubAggregation {
            name: "route_info".into(),
            kind: SubAggregationKind::TopSample {
                size: 1,
                includes: vec![
                    "origin_city_name".into(),
                    "dest_city_name".into(),
                    "origin_city_market_id".into(),
                    "dest_city_market_id".into(),
                ],
            },
        }],
        outputs: vec![
            out("year", from_key("year", FieldType::Integer)),
            out("month", from_key("month", FieldType::Integer)),
            out("air_carrier", from_key(carrier, FieldType::Text)),
            out(
                "air_carrier_name",
                OutputValue::Lookup { table: CARRIERS_TABLE.into(), from: key_ref(carrier) },
            ),
            out("flight_number", OutputValue::Concat(vec![key_ref(carrier), key_ref(flight_number)])),
            out("origin_airport", from_key("origin", FieldType::Text)),
            out("origin_city", split("origin_city_name", 0)),
            out("origin_state", split("origin_city_name", 1)),
            out("dest_airport", from_key("dest", FieldType::Text)),
            out("dest_city", split("dest_city_name", 0)),
            out("dest_state", split("dest_city_name", 1)),
            out(
                "domestic",
                OutputValue::AllFlags {
                    table: DOMESTIC_MARKETS_TABLE.into(),
                    from: vec![sample_ref("origin_city_market_id"), sample_ref("dest_city_market_id")],
                },
            ),
        ],
        id_fields: ids(&[
            partition("year"),
            partition("month"),
            key_ref("origin"),
            key_ref("dest"),
            key_ref(carrier),
            key_ref(flight_number),
        ]),
        sample_required: false,
        page_size: None,
        mapping: Some(json!({
            "mappings": { "properties": {
                "year": {"type": "short"},
                "month": {"type": "short"},
                "air_carrier": {"type": "keyword"},
                "air_carrier_name": {"type": "keyword"},
                "flight_number": {"type": "keyword"},
                "origin_airport": {"type": "keyword"},
                "origin_city": {"type": "keyword"},
                "origin_state": {"type": "keyword"},
                "dest_airport": {"type": "keyword"},
                "dest_city": {"type": "keyword"},
                "dest_state": {"type": "keyword"},
                "domestic": {"type": "boolean"}
            }}
        })),
    }
}

/// 🛫 Quarterly route summary from the market data: average fare, total passengers, and
/// names for both ends. Routes whose bucket has no sample document are skipped.
pub fn airport_flights() -> ReportSpec {
    let mut outputs = vec![
        out("year", from_partition("year")),
        out("quarter", from_partition("quarter")),
    ];
    for end in ["origin", "dest"] {
        outputs.push(out(&format!("{end}_airport"), from_key(end, FieldType::Text)));
        outputs.push(out(
            &format!("{end}_airport_name"),
            OutputValue::Lookup { table: AIRPORTS_TABLE.into(), from: key_ref(end) },
        ));
        outputs.push(out(
            &format!("{end}_city_name"),
            OutputValue::Lookup {
                table: CITY_MARKETS_TABLE.into(),
                from: sample_ref(&format!("{end}_city_market_id")),
            },
        ));
        for field in ["state", "state_name", "country"] {
            let name = format!("{end}_{field}");
            outputs.push(out(&name, from_sample(&name)));
        }
    }
    outputs.push(out(
        "passengers",
        OutputValue::Metric { aggregation: "total_passengers".into(), field_type: FieldType::Integer },
    ));
    outputs.push(out(
        "avg_fare",
        OutputValue::Metric { aggregation: "average_fare".into(), field_type: FieldType::Float },
    ));

    let mut properties = serde_json::Map::new();
    properties.insert("year".into(), json!({"type": "short"}));
    properties.insert("quarter".into(), json!({"type": "short"}));
    for output in &outputs {
        if !properties.contains_key(&output.name) {
            properties.insert(output.name.clone(), json!({"type": "keyword"}));
        }
    }
    properties.insert("passengers".into(), json!({"type": "integer"}));
    properties.insert("avg_fare".into(), json!({"type": "float"}));

    ReportSpec {
        name: "airport_flights".into(),
        source_collection: MARKETS.into(),
        destination_collection: "airport_flights".into(),
        partition_kind: PartitionKind::Quarterly,
        grouping: vec![key("origin", FieldType::Text), key("dest", FieldType::Text)],
        sub_aggregations: vec![
            SubAggregation {
                name: "average_fare".into(),
                kind: SubAggregationKind::Avg { field: "mkt_fare".into(), missing: 0.0 },
            },
            SubAggregation {
                name: "total_passengers".into(),
                kind: SubAggregationKind::Sum { field: "passengers".into(), missing: 0.0 },
            },
            SubAggregation {
                name: "route_info".into(),
                kind: SubAggregationKind::TopSample {
                    size: 1,
                    includes: [
                        "origin_city_market_id",
                        "origin_state",
                        "origin_state_name",
                        "origin_country",
                        "dest_city_market_id",
                        "dest_state",
                        "dest_state_name",
                        "dest_country",
                    ]
                    .map(String::from)
                    .to_vec(),
                },
            },
        ],
        outputs,
        id_fields: ids(&[partition("year"), partition("quarter"), key_ref("origin"), key_ref("dest")]),
        sample_required: true,
        page_size: Some(10_000),
        mapping: Some(json!({ "mappings": { "properties": properties } })),
    }
}

/// 📚 Every report, in run order.
pub fn catalog() -> Vec<ReportSpec> {
    vec![
        air_carrier_flight_report(),
        origin_airport_flight_report(),
        dest_airport_flight_report(),
        flight_cancel_data_report(),
        airlines(),
        airport_flights(),
    ]
}

/// 🎯 Pick reports by name, keeping the requested order. Empty means all of them.
/// An unknown name is an error; running "most" of what was asked for is a quiet surprise.
pub fn select(names: &[String]) -> Result<Vec<ReportSpec>> {
    let all = catalog();
    if names.is_empty() {
        return Ok(all);
    }
    names
        .iter()
        .map(|name| match all.iter().find(|report| &report.name == name) {
            Some(report) => Ok(report.clone()),
            None => bail!(
                "💀 No report named '{}'. Known reports: {}",
                name,
                all.iter().map(|r| r.name.as_str()).collect::<Vec<_>>().join(", ")
            ),
        })
        .collect()
}
