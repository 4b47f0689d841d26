// src/transform.rs
//! Pure per-record transform: store-safe keys, primary-key rename, ingestion
//! metadata. Records without a usable `id` are the only failure path.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{Result, SyncError};

/// Constant origin tag stamped on every document.
pub const SOURCE_TAG: &str = "otx_pulses_subscribed";

/// Run-scoped metadata stamped alongside the source tag.
#[derive(Debug, Clone, Copy)]
pub struct RunStamp<'a> {
    pub run_id: &'a str,
    pub page_no: u32,
}

/// The store rejects keys containing '.' or starting with '$'.
fn safe_key(key: &str) -> String {
    key.replace('.', "_").trim_start_matches('$').to_string()
}

fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_map(map)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        other => other.clone(),
    }
}

fn sanitize_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (safe_key(k), sanitize_value(v)))
        .collect()
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Enrich one raw pulse into a loadable document: sanitize keys, rename `id`
/// to the store's `_id` convention, stamp `_source`, `_ingested_at` and run
/// metadata. Everything else passes through unchanged.
pub fn enrich(raw: &Value, stamp: RunStamp<'_>, now: DateTime<Utc>) -> Result<Value> {
    let obj = raw.as_object().ok_or_else(|| SyncError::MalformedRecord {
        reason: "record is not a JSON object".to_string(),
    })?;
    let id = obj
        .get("id")
        .and_then(id_string)
        .ok_or_else(|| SyncError::MalformedRecord {
            reason: "record has no usable `id`".to_string(),
        })?;

    let mut doc = sanitize_map(obj);
    doc.remove("id");
    doc.insert("_id".to_string(), Value::String(id));
    doc.insert("_source".to_string(), Value::String(SOURCE_TAG.to_string()));
    doc.insert(
        "_ingested_at".to_string(),
        Value::String(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    doc.insert("run_id".to_string(), Value::String(stamp.run_id.to_string()));
    doc.insert("page_no".to_string(), Value::from(stamp.page_no));
    Ok(Value::Object(doc))
}

/// Timestamp a raw record contributes to the watermark: `modified`, falling
/// back to `created`.
pub fn observed_modified(raw: &Value) -> Option<DateTime<Utc>> {
    let s = raw
        .get("modified")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| raw.get("created").and_then(Value::as_str))?;
    parse_timestamp(s)
}

/// The feed emits both offset-carrying and naive-UTC timestamps.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|n| n.and_utc())
        })
}
