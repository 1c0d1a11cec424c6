//! Normalization of pre-0.4 log records.
//!
//! Older logs used `data` instead of `payload`, a `run.init` action and no
//! `schema_version`. They are rewritten on read; nothing is written back.

use serde_json::{Map, Value};

/// Schema version assumed for records that do not carry one.
pub const LEGACY_SCHEMA_VERSION: &str = "0.3.0";

/// Rewrites a raw record into the current wire shape.
#[must_use]
pub fn normalize_record(mut record: Map<String, Value>) -> Map<String, Value> {
    // `payload` wins when both are present.
    if let Some(data) = record.remove("data") {
        record.entry("payload").or_insert(data);
    }

    if record.get("action").and_then(Value::as_str) == Some("run.init") {
        record.insert("action".to_string(), Value::from("run.start"));
        let payload = record
            .entry("payload")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(payload) = payload {
            payload
                .entry("status")
                .or_insert_with(|| Value::from("initialized"));
        }
    }

    record
        .entry("schema_version")
        .or_insert_with(|| Value::from(LEGACY_SCHEMA_VERSION));
    record
}
