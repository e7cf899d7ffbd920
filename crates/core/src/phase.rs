//! Status normalization.
//!
//! The scheduler has shipped several status layouts over time and all of them can be seen
//! on a live cluster at once. Each payload is classified into a [`StatusShape`] once, at the
//! boundary; views only ever see the resulting phase string.
//!
//! Precedence (first match wins):
//! 1. `status.state.phase`
//! 2. `status.state` as a plain string
//! 3. legacy boolean flags `Running`, `Completed`, `Failed`, `Pending`, in that order
//! 4. `status` itself as a plain string
//! 5. `"Unknown"`
//!
//! Structured fields outrank the legacy flags: during a migration both may be present and
//! the flags lag behind.

use serde_json::Value as Json;

use crate::ResourceKind;

pub const UNKNOWN_PHASE: &str = "Unknown";

const LEGACY_FLAGS: [&str; 4] = ["Running", "Completed", "Failed", "Pending"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusShape<'a> {
    StructuredPhase(&'a str),
    LegacyState(&'a str),
    LegacyFlag(&'static str),
    Plain(&'a str),
    Absent,
}

impl<'a> StatusShape<'a> {
    pub fn classify(status: &'a Json) -> Self {
        match status {
            Json::String(s) => StatusShape::Plain(s),
            Json::Object(map) => {
                match map.get("state") {
                    Some(Json::Object(state)) => {
                        if let Some(Json::String(phase)) = state.get("phase") {
                            return StatusShape::StructuredPhase(phase);
                        }
                    }
                    Some(Json::String(state)) => return StatusShape::LegacyState(state),
                    _ => {}
                }
                LEGACY_FLAGS
                    .iter()
                    .find(|flag| map.get(**flag).map(truthy).unwrap_or(false))
                    .map(|flag| StatusShape::LegacyFlag(*flag))
                    .unwrap_or(StatusShape::Absent)
            }
            _ => StatusShape::Absent,
        }
    }

    pub fn phase(&self) -> &'a str {
        match *self {
            StatusShape::StructuredPhase(p) | StatusShape::LegacyState(p) | StatusShape::Plain(p) => p,
            StatusShape::LegacyFlag(f) => f,
            StatusShape::Absent => UNKNOWN_PHASE,
        }
    }
}

fn truthy(v: &Json) -> bool {
    match v {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Json::String(s) => !s.is_empty(),
        Json::Array(_) | Json::Object(_) => true,
    }
}

pub fn derive_phase(status: &Json) -> String {
    let phase = StatusShape::classify(status).phase();
    if phase.is_empty() { UNKNOWN_PHASE.to_string() } else { phase.to_string() }
}

/// Per-kind normalization. Pods and pod groups publish `status.phase`, which is checked
/// before the generic chain.
pub fn derive_phase_for(kind: ResourceKind, status: &Json) -> String {
    if matches!(kind, ResourceKind::Pod | ResourceKind::PodGroup) {
        if let Some(p) = status.get("phase").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
            return p.to_string();
        }
    }
    derive_phase(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_phase_beats_legacy_flag() {
        assert_eq!(derive_phase(&json!({ "state": { "phase": "Running" }, "Completed": true })), "Running");
    }

    #[test]
    fn legacy_flag_alone() {
        assert_eq!(derive_phase(&json!({ "Completed": true })), "Completed");
    }

    #[test]
    fn empty_is_unknown() {
        assert_eq!(derive_phase(&json!({})), "Unknown");
        assert_eq!(derive_phase(&Json::Null), "Unknown");
    }

    #[test]
    fn legacy_state_string_and_plain_status() {
        assert_eq!(derive_phase(&json!({ "state": "Open" })), "Open");
        assert_eq!(derive_phase(&json!("Pending")), "Pending");
    }

    #[test]
    fn flags_checked_in_fixed_order() {
        assert_eq!(derive_phase(&json!({ "Pending": true, "Failed": true })), "Failed");
        assert_eq!(derive_phase(&json!({ "Running": false, "Pending": 1 })), "Pending");
    }

    #[test]
    fn state_object_without_phase_falls_through_to_flags() {
        assert_eq!(derive_phase(&json!({ "state": { "reason": "x" }, "Failed": true })), "Failed");
    }

    #[test]
    fn pod_phase_is_kind_specific() {
        let pod = json!({ "phase": "Succeeded" });
        assert_eq!(derive_phase_for(ResourceKind::Pod, &pod), "Succeeded");
        assert_eq!(derive_phase_for(ResourceKind::Job, &pod), "Unknown");
        assert_eq!(derive_phase_for(ResourceKind::PodGroup, &json!({ "phase": "Inqueue" })), "Inqueue");
    }

    #[test]
    fn classify_reports_shape() {
        let s = json!({ "state": "Closed" });
        assert_eq!(StatusShape::classify(&s), StatusShape::LegacyState("Closed"));
        assert_eq!(StatusShape::classify(&json!(42)), StatusShape::Absent);
    }

    #[test]
    fn phase_outlives_the_shape() {
        let s = json!({ "state": { "phase": "Pending" } });
        let phase: &str = StatusShape::classify(&s).phase();
        assert_eq!(phase, "Pending");
    }
}
