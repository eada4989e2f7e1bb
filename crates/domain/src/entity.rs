//! Entity registrations — what a child process reports about its
//! addressable things after a successful `init`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::property::Property;

/// The value shape of one command parameter field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Boolean,
    Number,
    String,
    Object,
}

/// Describes one field of a command's parameter object so callers know
/// what shape to send. Adapters may refine the domain defaults per source
/// (narrower enum, tighter range).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandField {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enumerated_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// One property an entity exposes, with its open-vocabulary feature tags
/// and optional command hints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredProperty {
    pub property: Property,
    #[serde(default)]
    pub features: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub command_hints: BTreeMap<String, CommandField>,
}

/// An adapter-internal addressable thing (a lamp, a calendar, a vent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRegistration {
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub properties: Vec<RegisteredProperty>,
}

impl EntityRegistration {
    /// Look up the registered shape of one property, if the entity has it.
    pub fn property(&self, property: Property) -> Option<&RegisteredProperty> {
        self.properties.iter().find(|p| p.property == property)
    }
}

/// The kind of grouping an adapter hints at for space assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    Room,
    Zone,
    Area,
}

/// A natural grouping of entities reported alongside the registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityGroup {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: GroupType,
    #[serde(default)]
    pub entity_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_parses_wire_shape() {
        let json = r#"{
            "entityId": "e1",
            "displayName": "Desk lamp",
            "properties": [
                {
                    "property": "illumination",
                    "features": ["dimmable", "color_temp"],
                    "commandHints": {
                        "brightness": {"type": "number", "min": 0.0, "max": 100.0}
                    }
                }
            ]
        }"#;
        let reg: EntityRegistration = serde_json::from_str(json).unwrap();
        assert_eq!(reg.entity_id, "e1");
        let prop = reg.property(Property::Illumination).unwrap();
        assert!(prop.features.contains("dimmable"));
        assert_eq!(
            prop.command_hints["brightness"].field_type,
            FieldType::Number
        );
    }

    #[test]
    fn group_type_tag_is_lowercase() {
        let group: EntityGroup = serde_json::from_str(
            r#"{"id": "g1", "name": "Kitchen", "type": "room", "entityIds": ["e1", "e2"]}"#,
        )
        .unwrap();
        assert_eq!(group.group_type, GroupType::Room);
        assert_eq!(group.entity_ids, vec!["e1", "e2"]);
    }

    #[test]
    fn missing_optionals_default() {
        let reg: EntityRegistration =
            serde_json::from_str(r#"{"entityId": "bare"}"#).unwrap();
        assert!(reg.display_name.is_none());
        assert!(reg.properties.is_empty());
    }
}
