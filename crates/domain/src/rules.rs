//! Rule types for the reactive layer: triage lane assignment and local
//! reflex rules. The daemon only reads these; authoring happens upstream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Triage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where the triage classifier sends an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Immediate,
    Batched,
    Silent,
}

/// A configured triage rule. Every populated condition must match for the
/// rule to apply; specificity ranks competing matches (device 8, event
/// type 4, domain 2, area 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageRule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    pub lane: Lane,
    /// Events whose absolute numeric delta is below this go `silent`
    /// regardless of `lane`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_threshold: Option<f64>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

impl TriageRule {
    /// Specificity score; higher wins, insertion order breaks ties.
    pub fn specificity(&self) -> u8 {
        let mut score = 0;
        if self.device_id.is_some() {
            score += 8;
        }
        if self.event_type.is_some() {
            score += 4;
        }
        if self.device_domain.is_some() {
            score += 2;
        }
        if self.area.is_some() {
            score += 1;
        }
        score
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reflex
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What fires a reflex rule: a device/event pattern, or a scheduled
/// automation referencing it by id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflexTrigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Set for rules fired by scheduled automations instead of events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automation_id: Option<String>,
    /// Event-data values that must be strictly equal; absent keys are
    /// skipped.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub condition: BTreeMap<String, serde_json::Value>,
}

/// The command a firing rule issues through the normal dispatch path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflexAction {
    pub device_id: String,
    pub command: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A local reactive rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflexRule {
    pub id: String,
    pub trigger: ReflexTrigger,
    pub action: ReflexAction,
    pub reason: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}
