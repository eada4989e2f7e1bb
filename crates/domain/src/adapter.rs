//! Persistent adapter records and their config bags.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A bag of adapter-instance configuration. String values may be secret
/// references (`$secret:<hex>`); everything else is passed through to the
/// child verbatim.
pub type ConfigBag = BTreeMap<String, serde_json::Value>;

/// One configured adapter instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterRecord {
    /// Unique instance id (e.g. `hue-1`).
    pub id: String,
    /// The manifest type this record instantiates.
    #[serde(rename = "type")]
    pub adapter_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub config: ConfigBag,
}

/// Id prefix marking a short-lived onboarding handle (discovery/pairing
/// before any persistent record of the type exists).
pub const ONBOARDING_PREFIX: &str = "__onboarding_";

/// Build the well-known id for an onboarding handle of a given type.
pub fn onboarding_id(adapter_type: &str) -> String {
    format!("{ONBOARDING_PREFIX}{adapter_type}")
}

/// Whether an adapter id names an onboarding handle.
pub fn is_onboarding_id(id: &str) -> bool {
    id.starts_with(ONBOARDING_PREFIX)
}
