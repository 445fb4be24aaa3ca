use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::data::{KindData, NodeData, OutputMode};

/// Which boolean transitions count as a meaningful change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeMode {
    Level,
    #[default]
    Rising,
    Falling,
    Both,
}

/// Two numeric outputs further apart than this are epoch timestamps rather
/// than counters, so the source is treated as trigger-style.
pub const TIMESTAMP_JUMP: f64 = 1.0e9;

/// What change detection needs to know about the upstream source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceMeta {
    /// The source carries a `triggered` field.
    pub has_triggered: bool,
    /// The source is explicitly configured with `outputMode: trigger`.
    pub trigger_output: bool,
}

impl SourceMeta {
    pub fn of(data: &NodeData) -> Self {
        match &data.kind {
            KindData::Trigger(_) => Self {
                has_triggered: true,
                trigger_output: false,
            },
            KindData::Delay(d) => Self {
                has_triggered: false,
                trigger_output: d.output_mode == OutputMode::Trigger,
            },
            KindData::Legacy { fields, .. } => Self {
                has_triggered: fields.contains_key("triggered"),
                trigger_output: fields.get("outputMode").and_then(Value::as_str)
                    == Some("trigger"),
            },
            _ => Self::default(),
        }
    }
}

/// Decide whether a freshly observed upstream value is worth reprocessing.
/// The rules apply in order; the first that matches wins.
pub fn should_process(
    new: Option<&Value>,
    old: Option<&Value>,
    meta: &SourceMeta,
    mode: EdgeMode,
) -> bool {
    // 1. Nothing to process.
    let new = match new {
        None | Some(Value::Null) => return false,
        Some(v) => v,
    };
    // 2. First observation always processes.
    let old = match old {
        None | Some(Value::Null) => return true,
        Some(v) => v,
    };

    // 3. Numeric pair: NaN-aware comparison.
    if let (Some(a), Some(b)) = (new.as_f64(), old.as_f64()) {
        if a.is_nan() || b.is_nan() {
            return numbers_changed(a, b);
        }
        // 4. Trigger-style sources reprocess on every distinct pulse, even
        // when the pulse payload looks conceptually the same.
        if meta.has_triggered || meta.trigger_output || (a - b).abs() > TIMESTAMP_JUMP {
            return a != b;
        }
        // Integers compare exactly; an f64 round-trip can collapse distinct
        // values above 2^53.
        if let (Some(na), Some(nb)) = (new.as_u64(), old.as_u64()) {
            return na != nb;
        }
        if let (Some(na), Some(nb)) = (new.as_i64(), old.as_i64()) {
            return na != nb;
        }
        return a != b;
    }

    if meta.has_triggered || meta.trigger_output {
        return new != old;
    }

    // 5. Boolean pair: edge-detection policy.
    if let (Value::Bool(a), Value::Bool(b)) = (new, old) {
        // `b` is the previous value, `a` the new one.
        return match mode {
            EdgeMode::Rising => !b && *a,
            EdgeMode::Falling => *b && !a,
            EdgeMode::Both | EdgeMode::Level => a != b,
        };
    }

    // 6. Everything else: deep equality through serialization, failing open
    // toward reprocessing so an update is never silently dropped.
    !deep_equal(new, old)
}

/// NaN-aware numeric change check: NaN vs NaN counts as unchanged, exactly
/// one NaN counts as changed.
pub fn numbers_changed(new: f64, old: f64) -> bool {
    match (new.is_nan(), old.is_nan()) {
        (true, true) => false,
        (true, false) | (false, true) => true,
        (false, false) => new != old,
    }
}

fn deep_equal(a: &Value, b: &Value) -> bool {
    // Large integers serialize as their full decimal text, so this compares
    // them exactly where an f64 round-trip would lose precision.
    match (serde_json::to_string(a), serde_json::to_string(b)) {
        (Ok(sa), Ok(sb)) => sa == sb,
        _ => {
            warn!("deep-equality serialization failed; treating values as different");
            false
        }
    }
}
