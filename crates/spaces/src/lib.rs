//! Space/source registry — materialises configured spaces into an
//! in-memory model, indexes it for dispatch, and merges runtime entity
//! registrations into the configured view.
//!
//! Configuration is authoritative: the merge only ever adds runtime
//! features on top of what the user authored, and command hints from the
//! adapter overlay the domain defaults per key.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use hearth_domain::entity::{CommandField, EntityRegistration};
use hearth_domain::property::Property;
use hearth_domain::space::{
    Source, SourceProperty, SourcePropertyRow, SourceRoute, SourceRow, Space, SpaceRow,
};

/// Thread-safe registry of all configured spaces and sources.
pub struct SpaceRegistry {
    spaces: RwLock<HashMap<String, Space>>,
    routes: RwLock<HashMap<String, SourceRoute>>,
    /// Domain defaults for command hints, filled per property at load.
    domain_hints: HashMap<Property, BTreeMap<String, CommandField>>,
}

impl Default for SpaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceRegistry {
    pub fn new() -> Self {
        Self {
            spaces: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            domain_hints: default_command_hints(),
        }
    }

    /// Build the in-memory model from persisted rows. All sources start
    /// unreachable; property rows whose source row is missing are dropped
    /// with a warning, as are sources pointing at a missing space.
    pub fn load(
        &self,
        space_rows: Vec<SpaceRow>,
        source_rows: Vec<SourceRow>,
        property_rows: Vec<SourcePropertyRow>,
    ) {
        let mut spaces: HashMap<String, Space> = space_rows
            .into_iter()
            .map(|row| {
                (
                    row.id.clone(),
                    Space {
                        id: row.id,
                        display_name: row.display_name,
                        floor: row.floor,
                        sources: Vec::new(),
                    },
                )
            })
            .collect();

        let mut properties: HashMap<String, Vec<SourceProperty>> = HashMap::new();
        for row in property_rows {
            let hints = self
                .domain_hints
                .get(&row.property)
                .cloned()
                .unwrap_or_default();
            properties
                .entry(row.source_id.clone())
                .or_default()
                .push(SourceProperty {
                    property: row.property,
                    role: row.role,
                    mounting: row.mounting,
                    features: row.features,
                    command_hints: hints,
                });
        }

        let mut routes = HashMap::new();
        let mut source_count = 0usize;
        for row in source_rows {
            let Some(space) = spaces.get_mut(&row.space_id) else {
                tracing::warn!(
                    source = %row.id,
                    space = %row.space_id,
                    "source references a missing space, skipping"
                );
                continue;
            };
            routes.insert(
                row.id.clone(),
                SourceRoute {
                    adapter_id: row.adapter_id.clone(),
                    entity_id: row.entity_id.clone(),
                },
            );
            space.sources.push(Source {
                properties: properties.remove(&row.id).unwrap_or_default(),
                id: row.id,
                space_id: row.space_id,
                adapter_id: row.adapter_id,
                entity_id: row.entity_id,
                reachable: false,
            });
            source_count += 1;
        }

        for orphan in properties.keys() {
            tracing::warn!(source = %orphan, "property row references a missing source");
        }

        tracing::info!(
            spaces = spaces.len(),
            sources = source_count,
            "space registry loaded"
        );
        *self.spaces.write() = spaces;
        *self.routes.write() = routes;
    }

    // ── Reachability ───────────────────────────────────────────────

    /// Flip the reachable flag of every source owned by an adapter.
    pub fn set_adapter_reachability(&self, adapter_id: &str, reachable: bool) {
        let mut flipped = 0usize;
        let mut spaces = self.spaces.write();
        for space in spaces.values_mut() {
            for source in &mut space.sources {
                if source.adapter_id == adapter_id && source.reachable != reachable {
                    source.reachable = reachable;
                    flipped += 1;
                }
            }
        }
        if flipped > 0 {
            tracing::debug!(adapter = %adapter_id, reachable, flipped, "source reachability updated");
        }
    }

    // ── Feature merge ──────────────────────────────────────────────

    /// Merge a child's registrations into the configured sources of that
    /// adapter: union features, overlay adapter command hints on the
    /// domain defaults. Configured pairs the child did not register are
    /// left untouched.
    pub fn apply_entity_registrations(
        &self,
        adapter_id: &str,
        registrations: &[EntityRegistration],
    ) {
        let by_entity: HashMap<&str, &EntityRegistration> = registrations
            .iter()
            .map(|r| (r.entity_id.as_str(), r))
            .collect();

        let mut merged = 0usize;
        let mut spaces = self.spaces.write();
        for space in spaces.values_mut() {
            for source in &mut space.sources {
                if source.adapter_id != adapter_id {
                    continue;
                }
                let Some(registration) = by_entity.get(source.entity_id.as_str()) else {
                    continue;
                };
                for configured in &mut source.properties {
                    let Some(reported) = registration.property(configured.property) else {
                        continue;
                    };
                    configured
                        .features
                        .extend(reported.features.iter().cloned());
                    for (command, hint) in &reported.command_hints {
                        configured
                            .command_hints
                            .insert(command.clone(), hint.clone());
                    }
                    merged += 1;
                }
            }
        }
        tracing::debug!(adapter = %adapter_id, merged, "entity registrations merged");
    }

    // ── Lookup ─────────────────────────────────────────────────────

    /// The sources in a space whose property set contains the given
    /// property. Used for "affect everything in this space" commands.
    pub fn get_sources_for_property(&self, space_id: &str, property: Property) -> Vec<Source> {
        self.spaces
            .read()
            .get(space_id)
            .map(|space| {
                space
                    .sources
                    .iter()
                    .filter(|s| s.has_property(property))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// O(1) route for direct dispatch.
    pub fn get_source_route(&self, source_id: &str) -> Option<SourceRoute> {
        self.routes.read().get(source_id).cloned()
    }

    /// The space a given adapter entity maps into, if any.
    pub fn space_for_entity(&self, adapter_id: &str, entity_id: &str) -> Option<String> {
        let spaces = self.spaces.read();
        for space in spaces.values() {
            if space
                .sources
                .iter()
                .any(|s| s.adapter_id == adapter_id && s.entity_id == entity_id)
            {
                return Some(space.id.clone());
            }
        }
        None
    }

    /// All spaces with their sources, sorted by id.
    pub fn list(&self) -> Vec<Space> {
        let mut spaces: Vec<Space> = self.spaces.read().values().cloned().collect();
        spaces.sort_by(|a, b| a.id.cmp(&b.id));
        spaces
    }

    /// One source by id.
    pub fn get_source(&self, source_id: &str) -> Option<Source> {
        let spaces = self.spaces.read();
        spaces
            .values()
            .flat_map(|space| space.sources.iter())
            .find(|s| s.id == source_id)
            .cloned()
    }
}

/// A shared registry handle.
pub type SharedSpaceRegistry = Arc<SpaceRegistry>;

/// The command hints the property catalogue ships by default. Adapters
/// refine these per source; the overlay is adapter-wins-per-key.
fn default_command_hints() -> HashMap<Property, BTreeMap<String, CommandField>> {
    use hearth_domain::entity::FieldType;

    let mut hints = HashMap::new();

    let mut illumination = BTreeMap::new();
    illumination.insert(
        "on".to_string(),
        CommandField {
            field_type: FieldType::Boolean,
            description: Some("Switch the light on or off".into()),
            enumerated_values: None,
            min: None,
            max: None,
        },
    );
    illumination.insert(
        "brightness".to_string(),
        CommandField {
            field_type: FieldType::Number,
            description: Some("Brightness in percent".into()),
            enumerated_values: None,
            min: Some(0.0),
            max: Some(100.0),
        },
    );
    hints.insert(Property::Illumination, illumination);

    let mut climate = BTreeMap::new();
    climate.insert(
        "target_temperature".to_string(),
        CommandField {
            field_type: FieldType::Number,
            description: Some("Setpoint in degrees Celsius".into()),
            enumerated_values: None,
            min: Some(5.0),
            max: Some(30.0),
        },
    );
    hints.insert(Property::Climate, climate);

    let mut access = BTreeMap::new();
    access.insert(
        "lock".to_string(),
        CommandField {
            field_type: FieldType::Boolean,
            description: Some("Lock or unlock".into()),
            enumerated_values: None,
            min: None,
            max: None,
        },
    );
    hints.insert(Property::Access, access);

    hints
}
