//! Shared daemon state and the reasoning-queue boundary.

use std::sync::Arc;

use tokio::sync::mpsc;

use hearth_adapters::{AdapterRegistry, Supervisor};
use hearth_domain::config::Config;
use hearth_domain::event::DeviceEvent;
use hearth_reactor::{AggregatedEvent, ReflexMatcher, TriageClassifier};
use hearth_secrets::SecretStore;
use hearth_spaces::SpaceRegistry;

use crate::store::{AdapterStore, RuleStore, SpaceStore};

/// What the core hands to the reasoning layer. The layer itself is out of
/// scope; the daemon only guarantees this queue's semantics.
#[derive(Debug, Clone)]
pub enum ReasoningEvent {
    /// An event the triage classifier marked immediate.
    Immediate(DeviceEvent),
    /// One drain of the batch buffers: one synthetic event per device.
    Flush(Vec<AggregatedEvent>),
}

pub type ReasoningSender = mpsc::UnboundedSender<ReasoningEvent>;
pub type ReasoningReceiver = mpsc::UnboundedReceiver<ReasoningEvent>;

/// Everything long-lived, shared by tasks and the tools facade.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub secrets: Arc<SecretStore>,
    pub registry: Arc<AdapterRegistry>,
    pub supervisor: Supervisor,
    pub spaces: Arc<SpaceRegistry>,
    pub triage: Arc<TriageClassifier>,
    pub reflex: Arc<ReflexMatcher>,
    pub adapters: Arc<AdapterStore>,
    pub space_store: Arc<SpaceStore>,
    pub rules: Arc<RuleStore>,
    pub reasoning_tx: ReasoningSender,
}
