//! Reactive layer between raw adapter events and the reasoning queue:
//! the triage classifier assigns each event a lane, and the reflex
//! matcher fires local rules without waiting for the reasoning layer.

pub mod reflex;
pub mod triage;

pub use reflex::{CommandDispatcher, ReflexMatcher};
pub use triage::{AggregatedEvent, TriageClassifier};
