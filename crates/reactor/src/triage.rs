//! Triage classifier — sits between raw handle events and the reasoning
//! queue, assigning each event a lane: immediate, batched, or silent.
//!
//! Order of business per event: command-echo suppression, then the most
//! specific matching rule, then default classification. Batched events
//! buffer per device and drain on a periodic tick as one synthetic event
//! per device.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use hearth_domain::config::TriageConfig;
use hearth_domain::event::DeviceEvent;
use hearth_domain::rules::{Lane, TriageRule};

/// Numeric deltas below this are treated as no-change telemetry by the
/// default classification.
const DEFAULT_SMALL_DELTA: f64 = 0.001;

/// Event types that default to the immediate lane when no rule matches.
const IMMEDIATE_EVENT_TYPES: [&str; 6] =
    ["motion", "contact", "lock", "occupancy", "access", "safety"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Aggregation output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One device's batched events collapsed into a synthetic event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedEvent {
    pub device_id: String,
    pub event_type: String,
    pub count: usize,
    pub last_state: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_delta: Option<f64>,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
}

struct DeviceBatch {
    events: Vec<DeviceEvent>,
    hold_until: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Classifier
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TriageClassifier {
    config: TriageConfig,
    /// Rules in store insertion order (the tie-break).
    rules: RwLock<Vec<TriageRule>>,
    /// Pending command echoes: (device, event type) → deadline.
    echoes: Mutex<HashMap<(String, String), DateTime<Utc>>>,
    batches: Mutex<HashMap<String, DeviceBatch>>,
}

impl TriageClassifier {
    pub fn new(config: TriageConfig) -> Self {
        Self {
            config,
            rules: RwLock::new(Vec::new()),
            echoes: Mutex::new(HashMap::new()),
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the rule set, preserving the given order for tie-breaks.
    pub fn set_rules(&self, rules: Vec<TriageRule>) {
        tracing::debug!(count = rules.len(), "triage rules loaded");
        *self.rules.write() = rules;
    }

    // ── Echo suppression ───────────────────────────────────────────

    /// Arm the echo window for a command about to be sent.
    pub fn expect_echo(&self, device_id: &str, command: &str) {
        self.expect_echo_at(device_id, command, Utc::now());
    }

    pub fn expect_echo_at(&self, device_id: &str, command: &str, now: DateTime<Utc>) {
        let deadline = now + ChronoDuration::seconds(self.config.echo_window_secs as i64);
        self.echoes
            .lock()
            .insert((device_id.to_string(), command.to_string()), deadline);
    }

    /// Consume a matching pending echo. Expired entries are dropped.
    fn consume_echo(&self, event: &DeviceEvent, now: DateTime<Utc>) -> bool {
        let key = (event.device_id.clone(), event.event_type.clone());
        let mut echoes = self.echoes.lock();
        match echoes.get(&key) {
            Some(deadline) if now <= *deadline => {
                echoes.remove(&key);
                true
            }
            Some(_) => {
                echoes.remove(&key);
                false
            }
            None => false,
        }
    }

    // ── Classification ─────────────────────────────────────────────

    /// Assign the lane for one event.
    pub fn classify(&self, event: &DeviceEvent) -> Lane {
        self.classify_at(event, Utc::now())
    }

    pub fn classify_at(&self, event: &DeviceEvent, now: DateTime<Utc>) -> Lane {
        // 1. A state change matching a just-issued command is self-caused.
        if self.consume_echo(event, now) {
            return Lane::Silent;
        }

        // 2. Most specific matching rule wins; insertion order breaks ties.
        if let Some(rule) = self.best_rule(event) {
            if let (Some(threshold), Some(delta)) = (rule.delta_threshold, event.delta) {
                if delta.abs() < threshold {
                    return Lane::Silent;
                }
            }
            return rule.lane;
        }

        // 3. Defaults.
        if IMMEDIATE_EVENT_TYPES.contains(&event.event_type.as_str()) {
            return Lane::Immediate;
        }
        if event.event_type == "heartbeat" {
            return Lane::Silent;
        }
        if let Some(delta) = event.delta {
            if delta.abs() < DEFAULT_SMALL_DELTA {
                return Lane::Silent;
            }
        }
        Lane::Batched
    }

    fn best_rule(&self, event: &DeviceEvent) -> Option<TriageRule> {
        let rules = self.rules.read();
        let mut best: Option<(u8, usize)> = None;
        for (index, rule) in rules.iter().enumerate() {
            if !rule.enabled || !rule_matches(rule, event) {
                continue;
            }
            let specificity = rule.specificity();
            let wins = match best {
                Some((best_specificity, _)) => specificity > best_specificity,
                None => true,
            };
            if wins {
                best = Some((specificity, index));
            }
        }
        best.map(|(_, index)| rules[index].clone())
    }

    // ── Batching ───────────────────────────────────────────────────

    /// Classify and route one event. Returns the event when it should go
    /// straight to the reasoning queue; batched events are buffered and
    /// silent ones dropped.
    pub fn ingest(&self, event: DeviceEvent) -> Option<DeviceEvent> {
        self.ingest_at(event, Utc::now())
    }

    pub fn ingest_at(&self, event: DeviceEvent, now: DateTime<Utc>) -> Option<DeviceEvent> {
        match self.classify_at(&event, now) {
            Lane::Immediate => Some(event),
            Lane::Silent => None,
            Lane::Batched => {
                let hold = ChronoDuration::seconds(self.config.batch_hold_secs as i64);
                let mut batches = self.batches.lock();
                batches
                    .entry(event.device_id.clone())
                    .or_insert_with(|| DeviceBatch {
                        events: Vec::new(),
                        hold_until: now + hold,
                    })
                    .events
                    .push(event);
                None
            }
        }
    }

    /// Drain every device whose hold has elapsed, collapsing its buffer
    /// into one synthetic event. Called by the periodic tick; the whole
    /// result is delivered as a single flush.
    pub fn flush_due(&self) -> Vec<AggregatedEvent> {
        self.flush_due_at(Utc::now())
    }

    pub fn flush_due_at(&self, now: DateTime<Utc>) -> Vec<AggregatedEvent> {
        let mut batches = self.batches.lock();
        let due: Vec<String> = batches
            .iter()
            .filter(|(_, batch)| batch.hold_until <= now)
            .map(|(device, _)| device.clone())
            .collect();

        let mut aggregated: Vec<AggregatedEvent> = due
            .into_iter()
            .filter_map(|device| batches.remove(&device).map(|b| (device, b)))
            .map(|(device_id, batch)| aggregate(device_id, batch.events))
            .collect();
        aggregated.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        if !aggregated.is_empty() {
            let events: usize = aggregated.iter().map(|a| a.count).sum();
            tracing::debug!(
                devices = aggregated.len(),
                events,
                "flushing batched events"
            );
        }
        aggregated
    }

    /// Devices currently buffering.
    pub fn buffered_devices(&self) -> usize {
        self.batches.lock().len()
    }
}

fn rule_matches(rule: &TriageRule, event: &DeviceEvent) -> bool {
    if let Some(device_id) = &rule.device_id {
        if device_id != &event.device_id {
            return false;
        }
    }
    if let Some(event_type) = &rule.event_type {
        if event_type != &event.event_type {
            return false;
        }
    }
    if let Some(domain) = &rule.device_domain {
        if event.device_domain.as_deref() != Some(domain.as_str()) {
            return false;
        }
    }
    if let Some(area) = &rule.area {
        if event.area.as_deref() != Some(area.as_str()) {
            return false;
        }
    }
    true
}

fn aggregate(device_id: String, events: Vec<DeviceEvent>) -> AggregatedEvent {
    let deltas: Vec<f64> = events.iter().filter_map(|e| e.delta).collect();
    let (min_delta, max_delta, avg_delta) = if deltas.is_empty() {
        (None, None, None)
    } else {
        let min = deltas.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = deltas.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let avg = deltas.iter().sum::<f64>() / deltas.len() as f64;
        (Some(min), Some(max), Some(avg))
    };

    let first = events.first().expect("batch is never empty");
    let last = events.last().expect("batch is never empty");
    AggregatedEvent {
        device_id,
        event_type: last.event_type.clone(),
        count: events.len(),
        last_state: last.data.clone(),
        min_delta,
        max_delta,
        avg_delta,
        first_at: first.at,
        last_at: last.at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(device: &str, event_type: &str, delta: Option<f64>) -> DeviceEvent {
        DeviceEvent {
            device_id: device.into(),
            event_type: event_type.into(),
            device_domain: Some("demo".into()),
            area: Some("kitchen".into()),
            data: json!({"value": 1}),
            delta,
            at: Utc::now(),
        }
    }

    fn rule(id: &str, lane: Lane) -> TriageRule {
        TriageRule {
            id: id.into(),
            device_id: None,
            event_type: None,
            device_domain: None,
            area: None,
            lane,
            delta_threshold: None,
            enabled: true,
        }
    }

    #[test]
    fn echo_inside_window_is_silent_and_consumed() {
        let classifier = TriageClassifier::new(TriageConfig::default());
        let t0 = Utc::now();
        classifier.expect_echo_at("demo-1/e1", "illumination", t0);

        let e = event("demo-1/e1", "illumination", None);
        let t1 = t0 + ChronoDuration::seconds(1);
        assert_eq!(classifier.classify_at(&e, t1), Lane::Silent);

        // The echo was consumed: an identical later change is not suppressed.
        let t2 = t0 + ChronoDuration::seconds(2);
        assert_ne!(classifier.classify_at(&e, t2), Lane::Silent);
    }

    #[test]
    fn expired_echo_does_not_suppress() {
        let classifier = TriageClassifier::new(TriageConfig::default());
        let t0 = Utc::now();
        classifier.expect_echo_at("demo-1/e1", "illumination", t0);

        let e = event("demo-1/e1", "illumination", None);
        let late = t0 + ChronoDuration::seconds(6);
        assert_ne!(classifier.classify_at(&e, late), Lane::Silent);
    }

    #[test]
    fn echo_only_matches_same_device_and_type() {
        let classifier = TriageClassifier::new(TriageConfig::default());
        let t0 = Utc::now();
        classifier.expect_echo_at("demo-1/e1", "illumination", t0);

        let other_device = event("demo-1/e2", "illumination", None);
        assert_ne!(
            classifier.classify_at(&other_device, t0 + ChronoDuration::seconds(1)),
            Lane::Silent
        );
        // The original echo is still armed.
        let original = event("demo-1/e1", "illumination", None);
        assert_eq!(
            classifier.classify_at(&original, t0 + ChronoDuration::seconds(2)),
            Lane::Silent
        );
    }

    #[test]
    fn most_specific_rule_wins() {
        let classifier = TriageClassifier::new(TriageConfig::default());
        classifier.set_rules(vec![
            TriageRule {
                area: Some("kitchen".into()),
                ..rule("broad", Lane::Batched)
            },
            TriageRule {
                device_id: Some("demo-1/e1".into()),
                ..rule("specific", Lane::Immediate)
            },
        ]);

        let e = event("demo-1/e1", "power", Some(10.0));
        assert_eq!(classifier.classify(&e), Lane::Immediate);
    }

    #[test]
    fn ties_resolve_by_insertion_order() {
        let classifier = TriageClassifier::new(TriageConfig::default());
        classifier.set_rules(vec![
            TriageRule {
                event_type: Some("power".into()),
                ..rule("first", Lane::Silent)
            },
            TriageRule {
                event_type: Some("power".into()),
                ..rule("second", Lane::Immediate)
            },
        ]);

        let e = event("demo-1/e1", "power", Some(10.0));
        assert_eq!(classifier.classify(&e), Lane::Silent);
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let classifier = TriageClassifier::new(TriageConfig::default());
        classifier.set_rules(vec![TriageRule {
            event_type: Some("power".into()),
            enabled: false,
            ..rule("off", Lane::Immediate)
        }]);

        // Falls through to the batched default.
        let e = event("demo-1/e1", "power", Some(10.0));
        assert_eq!(classifier.classify(&e), Lane::Batched);
    }

    #[test]
    fn delta_threshold_forces_silent() {
        let classifier = TriageClassifier::new(TriageConfig::default());
        classifier.set_rules(vec![TriageRule {
            event_type: Some("climate".into()),
            delta_threshold: Some(0.5),
            ..rule("climate", Lane::Immediate)
        }]);

        let small = event("demo-1/e1", "climate", Some(0.2));
        assert_eq!(classifier.classify(&small), Lane::Silent);
        let negative_small = event("demo-1/e1", "climate", Some(-0.3));
        assert_eq!(classifier.classify(&negative_small), Lane::Silent);
        let large = event("demo-1/e1", "climate", Some(1.5));
        assert_eq!(classifier.classify(&large), Lane::Immediate);
        // No delta: the rule's declared lane stands.
        let no_delta = event("demo-1/e1", "climate", None);
        assert_eq!(classifier.classify(&no_delta), Lane::Immediate);
    }

    #[test]
    fn default_lanes() {
        let classifier = TriageClassifier::new(TriageConfig::default());
        assert_eq!(
            classifier.classify(&event("d", "occupancy", None)),
            Lane::Immediate
        );
        assert_eq!(
            classifier.classify(&event("d", "motion", None)),
            Lane::Immediate
        );
        assert_eq!(
            classifier.classify(&event("d", "heartbeat", None)),
            Lane::Silent
        );
        assert_eq!(
            classifier.classify(&event("d", "power", Some(0.0))),
            Lane::Silent
        );
        assert_eq!(
            classifier.classify(&event("d", "power", Some(5.0))),
            Lane::Batched
        );
        assert_eq!(
            classifier.classify(&event("d", "weather", None)),
            Lane::Batched
        );
    }

    #[test]
    fn batched_events_buffer_until_hold_elapses() {
        let classifier = TriageClassifier::new(TriageConfig::default());
        let t0 = Utc::now();

        assert!(classifier
            .ingest_at(event("d1", "power", Some(5.0)), t0)
            .is_none());
        assert!(classifier
            .ingest_at(event("d1", "power", Some(7.0)), t0 + ChronoDuration::seconds(5))
            .is_none());
        assert_eq!(classifier.buffered_devices(), 1);

        // Before the hold elapses nothing drains.
        assert!(classifier
            .flush_due_at(t0 + ChronoDuration::seconds(10))
            .is_empty());

        let flushed = classifier.flush_due_at(t0 + ChronoDuration::seconds(31));
        assert_eq!(flushed.len(), 1);
        let agg = &flushed[0];
        assert_eq!(agg.device_id, "d1");
        assert_eq!(agg.count, 2);
        assert_eq!(agg.min_delta, Some(5.0));
        assert_eq!(agg.max_delta, Some(7.0));
        assert_eq!(agg.avg_delta, Some(6.0));
        assert_eq!(classifier.buffered_devices(), 0);
    }

    #[test]
    fn flush_groups_per_device() {
        let classifier = TriageClassifier::new(TriageConfig::default());
        let t0 = Utc::now();
        classifier.ingest_at(event("b", "power", Some(1.0)), t0);
        classifier.ingest_at(event("a", "power", Some(2.0)), t0);

        let flushed = classifier.flush_due_at(t0 + ChronoDuration::seconds(31));
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].device_id, "a");
        assert_eq!(flushed[1].device_id, "b");
    }

    #[test]
    fn immediate_events_pass_straight_through() {
        let classifier = TriageClassifier::new(TriageConfig::default());
        let passed = classifier.ingest(event("d", "motion", None));
        assert!(passed.is_some());
        assert_eq!(classifier.buffered_devices(), 0);
    }
}
