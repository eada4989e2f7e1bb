//! The configured world: spaces, the sources that bind adapter entities
//! into them, and the flat row forms those are persisted as.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::entity::CommandField;
use crate::property::Property;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Materialised model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-property metadata on a source. `role` and `mounting` are free-form
/// authoring hints; `features` starts as configured and is unioned with
/// runtime-reported features on registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceProperty {
    pub property: Property,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mounting: Option<String>,
    #[serde(default)]
    pub features: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub command_hints: BTreeMap<String, CommandField>,
}

/// A configured binding from an adapter entity into a space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub space_id: String,
    pub adapter_id: String,
    pub entity_id: String,
    #[serde(default)]
    pub properties: Vec<SourceProperty>,
    /// Tracks the running-state of the owning adapter's handle.
    #[serde(default)]
    pub reachable: bool,
}

impl Source {
    /// The configured metadata for one property, if this source has it.
    pub fn property(&self, property: Property) -> Option<&SourceProperty> {
        self.properties.iter().find(|p| p.property == property)
    }

    pub fn has_property(&self, property: Property) -> bool {
        self.property(property).is_some()
    }
}

/// A user-authored physical area containing sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Space {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floor: Option<String>,
    #[serde(default)]
    pub sources: Vec<Source>,
}

/// Materialised `sourceId → (adapterId, entityId)` route for dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRoute {
    pub adapter_id: String,
    pub entity_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persisted rows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Flat space row as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceRow {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floor: Option<String>,
}

/// Flat source row as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRow {
    pub id: String,
    pub space_id: String,
    pub adapter_id: String,
    pub entity_id: String,
}

/// Flat source-property row as stored on disk; keyed by
/// `(source_id, property)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcePropertyRow {
    pub source_id: String,
    pub property: Property,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mounting: Option<String>,
    #[serde(default)]
    pub features: BTreeSet<String>,
}
