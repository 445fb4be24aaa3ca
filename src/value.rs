use serde_json::{Map, Value};

use crate::data::{KindData, NodeData};

/// Generic fallback order over legacy/unknown data bags.
const PRIORITY_FIELDS: [&str; 4] = ["outputValue", "value", "text", "triggered"];

/// Extract the semantically relevant output value of a node's data bag.
/// `None` means "no meaningful output"; callers never treat that as an
/// error. Null values are folded into `None`.
pub fn extract(data: &NodeData) -> Option<Value> {
    // Test-input nodes are special-cased before the generic walk: their
    // canonical output lives in the field literally named `value`.
    if let KindData::TestInput(d) = &data.kind {
        return defined(d.value.clone());
    }

    if let Some(v) = &data.output_value {
        return defined(Some(v.clone()));
    }

    match &data.kind {
        KindData::Text(d) => defined(Some(Value::String(d.text.clone()))),
        KindData::Trigger(d) => d.triggered.and_then(|ts| defined(serde_json::Number::from_f64(ts).map(Value::Number))),
        KindData::Cycle(d) => d.value.map(Value::Bool),
        KindData::Transform(d) => d.text.clone().map(Value::String),
        KindData::ViewOutput(d) => {
            if d.items.is_empty() {
                None
            } else {
                Some(Value::Array(d.items.clone()))
            }
        }
        KindData::Delay(_) => None,
        KindData::Legacy { fields, .. } => extract_legacy(fields),
        KindData::TestInput(_) => unreachable!("handled above"),
    }
}

fn extract_legacy(fields: &Map<String, Value>) -> Option<Value> {
    for name in PRIORITY_FIELDS {
        match fields.get(name) {
            Some(Value::Null) | None => continue,
            Some(v) => return Some(v.clone()),
        }
    }
    None
}

fn defined(v: Option<Value>) -> Option<Value> {
    match v {
        Some(Value::Null) | None => None,
        some => some,
    }
}

/// Whether an extracted value is meaningful enough to activate a head node:
/// defined, non-empty, and non-NaN.
pub fn is_meaningful(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Number(n) => n.as_f64().map(|f| !f.is_nan()).unwrap_or(true),
        Value::Bool(_) => true,
    }
}
