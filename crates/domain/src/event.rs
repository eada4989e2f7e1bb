//! Events flowing out of adapter handles and into the reactive layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::property::Property;

/// A raw state change surfaced by a running adapter handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub adapter_id: String,
    pub entity_id: String,
    pub property: Property,
    pub state: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<serde_json::Value>,
}

/// An event as seen by the triage classifier and the reflex matcher:
/// the state change plus the addressing context the daemon resolved for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    /// Stable device address: `<adapterId>/<entityId>`.
    pub device_id: String,
    /// Event type, normally the property name (`illumination`, …) or a
    /// derived kind such as `heartbeat`.
    pub event_type: String,
    /// The adapter type, used by domain-scoped triage rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_domain: Option<String>,
    /// The space the source sits in, when the entity maps to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    pub data: serde_json::Value,
    /// Numeric delta against the previous state, when both are numeric.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    pub at: DateTime<Utc>,
}

impl DeviceEvent {
    /// Join an adapter id and entity id into the triage device address.
    pub fn device_address(adapter_id: &str, entity_id: &str) -> String {
        format!("{adapter_id}/{entity_id}")
    }
}

/// Extract a numeric delta from a state transition, when both sides carry
/// a comparable number. Objects are probed for the first numeric member
/// present in both shapes.
pub fn numeric_delta(
    state: &serde_json::Value,
    previous: Option<&serde_json::Value>,
) -> Option<f64> {
    let previous = previous?;
    match (state, previous) {
        (serde_json::Value::Number(a), serde_json::Value::Number(b)) => {
            Some(a.as_f64()? - b.as_f64()?)
        }
        (serde_json::Value::Object(a), serde_json::Value::Object(b)) => {
            for (key, value) in a {
                if let (Some(x), Some(y)) = (value.as_f64(), b.get(key).and_then(|v| v.as_f64()))
                {
                    return Some(x - y);
                }
            }
            None
        }
        _ => None,
    }
}
