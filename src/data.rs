use std::borrow::Cow;

use schemars::{JsonSchema, Schema, SchemaGenerator, json_schema};
use serde::de::Error as DeError;
use serde::ser::Error as SerError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::change::EdgeMode;
use crate::error::NodeError;

/// How a delay node transforms a dequeued item before writing it out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Passthrough,
    Boolean,
    Trigger,
}

/// Operation applied by a transform node to its first upstream output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TransformOp {
    #[default]
    Uppercase,
    Lowercase,
    Trim,
    Stringify,
    /// Parses the input as a decimal number; fails on non-numeric text.
    ParseNumber,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TextData {
    pub text: String,
}

/// Test-input nodes hold their canonical output in a field literally named
/// `value`; value extraction checks it before the generic priority walk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TestInputData {
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerData {
    pub edge_mode: EdgeMode,
    /// Millisecond timestamp of the last emitted pulse.
    pub triggered: Option<f64>,
    pub value: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CycleData {
    pub interval_ms: u64,
    pub running: bool,
    pub value: Option<bool>,
}

impl Default for CycleData {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            running: false,
            value: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DelayData {
    pub delay_ms: u64,
    pub output_mode: OutputMode,
    pub queue_items: Vec<Value>,
    pub queue_length: usize,
    /// Countdown fraction, 1.0 at start of a cycle down to 0.0.
    pub progress: f64,
}

impl Default for DelayData {
    fn default() -> Self {
        Self {
            delay_ms: 100,
            output_mode: OutputMode::Passthrough,
            queue_items: Vec::new(),
            queue_length: 0,
            progress: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TransformData {
    pub op: TransformOp,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ViewOutputData {
    pub items: Vec<Value>,
}

/// Closed set of node kinds plus a `Legacy` arm for unknown kinds, which
/// keeps documents written by newer editors loadable: their fields stay in
/// an open map and value extraction falls back to the priority walk.
#[derive(Debug, Clone, PartialEq)]
pub enum KindData {
    Text(TextData),
    TestInput(TestInputData),
    Trigger(TriggerData),
    Cycle(CycleData),
    Delay(DelayData),
    Transform(TransformData),
    ViewOutput(ViewOutputData),
    Legacy { kind: String, fields: Map<String, Value> },
}

impl KindData {
    pub fn tag(&self) -> &str {
        match self {
            KindData::Text(_) => "text",
            KindData::TestInput(_) => "testInput",
            KindData::Trigger(_) => "trigger",
            KindData::Cycle(_) => "cycle",
            KindData::Delay(_) => "delay",
            KindData::Transform(_) => "transform",
            KindData::ViewOutput(_) => "viewOutput",
            KindData::Legacy { kind, .. } => kind,
        }
    }

    pub(crate) fn from_tagged(tag: &str, fields: Map<String, Value>) -> Result<Self, NodeError> {
        let value = Value::Object(fields);
        let decode = |e: serde_json::Error| NodeError::Serialization(e.to_string());
        match tag {
            "text" => Ok(KindData::Text(serde_json::from_value(value).map_err(decode)?)),
            "testInput" => Ok(KindData::TestInput(
                serde_json::from_value(value).map_err(decode)?,
            )),
            "trigger" => Ok(KindData::Trigger(
                serde_json::from_value(value).map_err(decode)?,
            )),
            "cycle" => Ok(KindData::Cycle(serde_json::from_value(value).map_err(decode)?)),
            "delay" => Ok(KindData::Delay(serde_json::from_value(value).map_err(decode)?)),
            "transform" => Ok(KindData::Transform(
                serde_json::from_value(value).map_err(decode)?,
            )),
            "viewOutput" => Ok(KindData::ViewOutput(
                serde_json::from_value(value).map_err(decode)?,
            )),
            other => {
                let fields = match value {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                Ok(KindData::Legacy {
                    kind: other.to_string(),
                    fields,
                })
            }
        }
    }

    pub(crate) fn to_fields(&self) -> Result<Map<String, Value>, NodeError> {
        let encode = |e: serde_json::Error| NodeError::Serialization(e.to_string());
        let value = match self {
            KindData::Text(d) => serde_json::to_value(d).map_err(encode)?,
            KindData::TestInput(d) => serde_json::to_value(d).map_err(encode)?,
            KindData::Trigger(d) => serde_json::to_value(d).map_err(encode)?,
            KindData::Cycle(d) => serde_json::to_value(d).map_err(encode)?,
            KindData::Delay(d) => serde_json::to_value(d).map_err(encode)?,
            KindData::Transform(d) => serde_json::to_value(d).map_err(encode)?,
            KindData::ViewOutput(d) => serde_json::to_value(d).map_err(encode)?,
            KindData::Legacy { fields, .. } => return Ok(fields.clone()),
        };
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(NodeError::Serialization(
                "kind data did not serialize to an object".to_string(),
            )),
        }
    }

    /// Safe default a node is reset to by the error-recovery entry point.
    pub fn recovery_default(tag: &str) -> Self {
        match tag {
            "text" => KindData::Text(TextData::default()),
            "testInput" => KindData::TestInput(TestInputData::default()),
            "trigger" => KindData::Trigger(TriggerData::default()),
            "cycle" => KindData::Cycle(CycleData::default()),
            "delay" => KindData::Delay(DelayData::default()),
            "transform" => KindData::Transform(TransformData::default()),
            "viewOutput" => KindData::ViewOutput(ViewOutputData::default()),
            other => KindData::Legacy {
                kind: other.to_string(),
                fields: Map::new(),
            },
        }
    }

    /// Plain input sources bypass the processing throttle so typing never
    /// lags behind by a frame.
    pub fn is_latency_sensitive(&self) -> bool {
        matches!(self, KindData::Text(_) | KindData::TestInput(_))
    }

    /// Kinds whose activation flips at pulse rate and therefore get the
    /// GPU/compositing hint on the visual layer.
    pub fn is_pulse_like(&self) -> bool {
        matches!(
            self,
            KindData::Trigger(_) | KindData::Cycle(_) | KindData::Delay(_)
        )
    }

    /// Kinds exposing a derived boolean `value` output.
    pub fn has_boolean_output(&self) -> bool {
        matches!(self, KindData::Trigger(_) | KindData::Cycle(_))
    }
}

/// A node's full data bag: the kind-specific payload plus the derived fields
/// every node carries. `is_active` is always recomputable from the rest of
/// the data and upstream state; it never outlives a recomputation.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeData {
    pub kind: KindData,
    pub is_active: bool,
    pub error: Option<String>,
    pub output_value: Option<Value>,
}

impl NodeData {
    pub fn new(kind: KindData) -> Self {
        Self {
            kind,
            is_active: false,
            error: None,
            output_value: None,
        }
    }

    pub fn tag(&self) -> &str {
        self.kind.tag()
    }

    /// Flat wire form: kind fields merged with the tag and derived fields.
    pub fn to_object(&self) -> Result<Map<String, Value>, NodeError> {
        let mut map = self.kind.to_fields()?;
        map.insert("kind".to_string(), Value::String(self.tag().to_string()));
        map.insert("isActive".to_string(), Value::Bool(self.is_active));
        match &self.error {
            Some(msg) => {
                map.insert("error".to_string(), Value::String(msg.clone()));
            }
            None => {
                map.remove("error");
            }
        }
        match &self.output_value {
            Some(v) => {
                map.insert("outputValue".to_string(), v.clone());
            }
            None => {
                map.remove("outputValue");
            }
        }
        Ok(map)
    }

    pub fn from_object(mut map: Map<String, Value>) -> Result<Self, NodeError> {
        let tag = match map.remove("kind") {
            Some(Value::String(s)) => s,
            Some(other) => {
                return Err(NodeError::Serialization(format!(
                    "`kind` must be a string, got {}",
                    other
                )));
            }
            None => "unknown".to_string(),
        };
        let is_active = map
            .remove("isActive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let error = match map.remove("error") {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };
        let output_value = match map.remove("outputValue") {
            Some(Value::Null) | None => None,
            Some(v) => Some(v),
        };
        Ok(Self {
            kind: KindData::from_tagged(&tag, map)?,
            is_active,
            error,
            output_value,
        })
    }

    /// Shallow merge-patch: the single mutation shape accepted by the store.
    /// Returns the patched data and whether anything actually changed.
    pub fn apply_patch(&self, patch: &Map<String, Value>) -> Result<(Self, bool), NodeError> {
        let before = self.to_object()?;
        let mut after = before.clone();
        for (key, value) in patch {
            if key == "kind" {
                // A node never changes kind through a data patch.
                continue;
            }
            after.insert(key.clone(), value.clone());
        }
        after.insert("kind".to_string(), Value::String(self.tag().to_string()));
        let changed = after != before;
        let next = Self::from_object(after)?;
        Ok((next, changed))
    }

    /// Patch applied when a node deactivates: the output fields must become
    /// absent so downstream consumers never observe a stale usable value.
    pub fn deactivation_patch(&self) -> Map<String, Value> {
        let mut patch = Map::new();
        patch.insert("isActive".to_string(), Value::Bool(false));
        patch.insert("outputValue".to_string(), Value::Null);
        if self.kind.has_boolean_output() {
            patch.insert("value".to_string(), Value::Null);
        }
        if matches!(self.kind, KindData::Transform(_)) {
            patch.insert("text".to_string(), Value::Null);
        }
        patch
    }

    /// Kind-specific safe default used by error recovery.
    pub fn error_recovery_data(tag: &str) -> Self {
        Self::new(KindData::recovery_default(tag))
    }
}

// The wire form is flat (`to_object`), not the nested struct shape, so the
// schema is written by hand to match what actually serializes.
impl JsonSchema for NodeData {
    fn schema_name() -> Cow<'static, str> {
        "NodeData".into()
    }

    fn json_schema(_generator: &mut SchemaGenerator) -> Schema {
        json_schema!({
            "type": "object",
            "description": "Flat node data bag: the kind tag and derived fields merged with the kind-specific payload fields",
            "properties": {
                "kind": { "type": "string" },
                "isActive": { "type": "boolean" },
                "error": { "type": "string" },
                "outputValue": true
            },
            "required": ["kind"],
            "additionalProperties": true
        })
    }
}

impl Serialize for NodeData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let map = self.to_object().map_err(S::Error::custom)?;
        map.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodeData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let map = match value {
            Value::Object(map) => map,
            other => {
                return Err(D::Error::custom(format!(
                    "node data must be an object, got {}",
                    other
                )));
            }
        };
        Self::from_object(map).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_round_trip_known_kind() {
        let data = NodeData::new(KindData::Delay(DelayData {
            delay_ms: 250,
            output_mode: OutputMode::Boolean,
            ..Default::default()
        }));
        let wire = serde_json::to_value(&data).unwrap();
        assert_eq!(wire["kind"], "delay");
        assert_eq!(wire["delayMs"], 250);
        assert_eq!(wire["outputMode"], "boolean");
        let back: NodeData = serde_json::from_value(wire).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_unknown_kind_lands_in_legacy_arm() {
        let wire = json!({ "kind": "sparkline", "value": 3, "window": 10 });
        let data: NodeData = serde_json::from_value(wire).unwrap();
        match &data.kind {
            KindData::Legacy { kind, fields } => {
                assert_eq!(kind, "sparkline");
                assert_eq!(fields["window"], 10);
            }
            other => panic!("expected legacy, got {:?}", other),
        }
        // And it survives re-serialization with its fields intact.
        let wire = serde_json::to_value(&data).unwrap();
        assert_eq!(wire["kind"], "sparkline");
        assert_eq!(wire["value"], 3);
    }

    #[test]
    fn test_apply_patch_merges_shallowly() {
        let data = NodeData::new(KindData::Text(TextData {
            text: "hello".to_string(),
        }));
        let (next, changed) = data
            .apply_patch(&obj(json!({ "text": "world", "isActive": true })))
            .unwrap();
        assert!(changed);
        assert!(next.is_active);
        match next.kind {
            KindData::Text(TextData { ref text }) => assert_eq!(text, "world"),
            _ => panic!("kind changed"),
        }
    }

    #[test]
    fn test_apply_identical_patch_reports_unchanged() {
        let data = NodeData::new(KindData::Text(TextData {
            text: "same".to_string(),
        }));
        let (_, changed) = data.apply_patch(&obj(json!({ "text": "same" }))).unwrap();
        assert!(!changed);
    }

    #[test]
    fn test_patch_cannot_change_kind() {
        let data = NodeData::new(KindData::Text(TextData::default()));
        let (next, _) = data.apply_patch(&obj(json!({ "kind": "delay" }))).unwrap();
        assert_eq!(next.tag(), "text");
    }

    #[test]
    fn test_null_patch_clears_optional_field() {
        let mut data = NodeData::new(KindData::TestInput(TestInputData {
            value: Some(json!(42)),
        }));
        data.output_value = Some(json!(42));
        let (next, changed) = data
            .apply_patch(&obj(json!({ "value": null, "outputValue": null })))
            .unwrap();
        assert!(changed);
        assert_eq!(next.output_value, None);
        match next.kind {
            KindData::TestInput(TestInputData { value }) => assert_eq!(value, None),
            _ => panic!("kind changed"),
        }
    }

    #[test]
    fn test_deactivation_patch_clears_outputs() {
        let data = NodeData::new(KindData::Trigger(TriggerData::default()));
        let patch = data.deactivation_patch();
        assert_eq!(patch["isActive"], Value::Bool(false));
        assert_eq!(patch["outputValue"], Value::Null);
        assert_eq!(patch["value"], Value::Null);
    }

    #[test]
    fn test_schema_describes_the_flat_wire_form() {
        let schema = serde_json::to_value(schemars::schema_for!(NodeData)).unwrap();
        let props = &schema["properties"];
        assert!(props.get("kind").is_some());
        assert!(props.get("isActive").is_some());
        // No nested struct-shape leftovers.
        assert!(props.get("is_active").is_none());
        assert!(props.get("data").is_none());

        // Every key the serializer emits is valid under the schema.
        let wire = serde_json::to_value(&NodeData::new(KindData::Text(TextData {
            text: "hi".to_string(),
        })))
        .unwrap();
        assert!(wire.get("kind").is_some());
        assert!(wire.get("isActive").is_some());
        assert_eq!(schema["additionalProperties"], Value::Bool(true));
    }

    #[test]
    fn test_error_recovery_data_is_inactive_and_clean() {
        let data = NodeData::error_recovery_data("delay");
        assert_eq!(data.tag(), "delay");
        assert!(!data.is_active);
        assert!(data.error.is_none());
        assert!(data.output_value.is_none());
    }
}
