//! Reflex matcher — condition-indexed firing of local rules against
//! events, without a round-trip through the reasoning layer.

use async_trait::async_trait;
use parking_lot::RwLock;

use hearth_domain::event::DeviceEvent;
use hearth_domain::rules::ReflexRule;

/// The normal dispatch path a firing rule issues its command through.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        device_id: &str,
        command: &str,
        params: serde_json::Value,
    ) -> Result<(), String>;
}

pub struct ReflexMatcher {
    /// Rules in store order.
    rules: RwLock<Vec<ReflexRule>>,
}

impl Default for ReflexMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ReflexMatcher {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
        }
    }

    pub fn set_rules(&self, rules: Vec<ReflexRule>) {
        tracing::debug!(count = rules.len(), "reflex rules loaded");
        *self.rules.write() = rules;
    }

    /// The first enabled rule whose trigger matches the event. Rules
    /// triggered by automations never match events.
    pub fn match_event(&self, event: &DeviceEvent) -> Option<ReflexRule> {
        self.rules
            .read()
            .iter()
            .find(|rule| rule.enabled && event_trigger_matches(rule, event))
            .cloned()
    }

    /// All enabled rules a scheduled automation references.
    pub fn match_automation(&self, automation_id: &str) -> Vec<ReflexRule> {
        self.rules
            .read()
            .iter()
            .filter(|rule| {
                rule.enabled && rule.trigger.automation_id.as_deref() == Some(automation_id)
            })
            .cloned()
            .collect()
    }

    /// Fire the first matching rule for an event. The result is logged;
    /// a failure never propagates to the event path.
    pub async fn fire_event(&self, event: &DeviceEvent, dispatcher: &dyn CommandDispatcher) {
        let Some(rule) = self.match_event(event) else {
            return;
        };
        fire(&rule, dispatcher).await;
    }

    /// Fire every rule a scheduled automation references. A failing rule
    /// does not inhibit the rest.
    pub async fn fire_automation(&self, automation_id: &str, dispatcher: &dyn CommandDispatcher) {
        for rule in self.match_automation(automation_id) {
            fire(&rule, dispatcher).await;
        }
    }
}

async fn fire(rule: &ReflexRule, dispatcher: &dyn CommandDispatcher) {
    let result = dispatcher
        .dispatch(
            &rule.action.device_id,
            &rule.action.command,
            rule.action.params.clone(),
        )
        .await;
    match result {
        Ok(()) => tracing::info!(
            rule = %rule.id,
            device = %rule.action.device_id,
            command = %rule.action.command,
            reason = %rule.reason,
            "reflex rule fired"
        ),
        Err(e) => tracing::warn!(
            rule = %rule.id,
            device = %rule.action.device_id,
            error = %e,
            "reflex rule failed"
        ),
    }
}

fn event_trigger_matches(rule: &ReflexRule, event: &DeviceEvent) -> bool {
    let trigger = &rule.trigger;
    if trigger.automation_id.is_some() {
        return false;
    }
    if let Some(device_id) = &trigger.device_id {
        if device_id != &event.device_id {
            return false;
        }
    }
    if let Some(event_type) = &trigger.event_type {
        if event_type != &event.event_type {
            return false;
        }
    }
    // Condition values must be strictly equal; keys the event data does
    // not carry are skipped.
    for (key, expected) in &trigger.condition {
        if let Some(actual) = event.data.get(key) {
            if actual != expected {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use parking_lot::Mutex;
    use serde_json::json;

    use hearth_domain::rules::{ReflexAction, ReflexTrigger};

    struct RecordingDispatcher {
        calls: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl RecordingDispatcher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl CommandDispatcher for RecordingDispatcher {
        async fn dispatch(
            &self,
            device_id: &str,
            command: &str,
            _params: serde_json::Value,
        ) -> Result<(), String> {
            self.calls
                .lock()
                .push((device_id.to_string(), command.to_string()));
            if self.fail {
                Err("adapter unreachable".into())
            } else {
                Ok(())
            }
        }
    }

    fn event(device: &str, event_type: &str, data: serde_json::Value) -> DeviceEvent {
        DeviceEvent {
            device_id: device.into(),
            event_type: event_type.into(),
            device_domain: None,
            area: None,
            data,
            delta: None,
            at: Utc::now(),
        }
    }

    fn motion_rule(id: &str) -> ReflexRule {
        ReflexRule {
            id: id.into(),
            trigger: ReflexTrigger {
                device_id: None,
                event_type: Some("occupancy".into()),
                automation_id: None,
                condition: [("motion".to_string(), json!(true))].into_iter().collect(),
            },
            action: ReflexAction {
                device_id: "hue-1/hall".into(),
                command: "turn_on".into(),
                params: json!({"brightness": 30}),
            },
            reason: "hall light on motion".into(),
            enabled: true,
        }
    }

    #[test]
    fn condition_equality_is_strict() {
        let matcher = ReflexMatcher::new();
        matcher.set_rules(vec![motion_rule("r1")]);

        assert!(matcher
            .match_event(&event("d", "occupancy", json!({"motion": true})))
            .is_some());
        assert!(matcher
            .match_event(&event("d", "occupancy", json!({"motion": false})))
            .is_none());
        // Type mismatch is a mismatch, not a coercion.
        assert!(matcher
            .match_event(&event("d", "occupancy", json!({"motion": 1})))
            .is_none());
    }

    #[test]
    fn absent_condition_keys_are_skipped() {
        let matcher = ReflexMatcher::new();
        matcher.set_rules(vec![motion_rule("r1")]);

        // The event data carries no "motion" key: the condition is skipped.
        assert!(matcher
            .match_event(&event("d", "occupancy", json!({"lux": 12})))
            .is_some());
    }

    #[test]
    fn first_matching_rule_wins() {
        let matcher = ReflexMatcher::new();
        let mut second = motion_rule("r2");
        second.action.command = "turn_off".into();
        matcher.set_rules(vec![motion_rule("r1"), second]);

        let matched = matcher
            .match_event(&event("d", "occupancy", json!({"motion": true})))
            .unwrap();
        assert_eq!(matched.id, "r1");
    }

    #[test]
    fn disabled_rules_never_match() {
        let matcher = ReflexMatcher::new();
        let mut rule = motion_rule("r1");
        rule.enabled = false;
        matcher.set_rules(vec![rule]);

        assert!(matcher
            .match_event(&event("d", "occupancy", json!({"motion": true})))
            .is_none());
    }

    #[test]
    fn automation_rules_ignore_events() {
        let matcher = ReflexMatcher::new();
        let mut rule = motion_rule("r1");
        rule.trigger.automation_id = Some("morning".into());
        matcher.set_rules(vec![rule]);

        assert!(matcher
            .match_event(&event("d", "occupancy", json!({"motion": true})))
            .is_none());
        assert_eq!(matcher.match_automation("morning").len(), 1);
        assert!(matcher.match_automation("evening").is_empty());
    }

    #[tokio::test]
    async fn fire_event_dispatches_the_action() {
        let matcher = ReflexMatcher::new();
        matcher.set_rules(vec![motion_rule("r1")]);
        let dispatcher = RecordingDispatcher::new(false);

        matcher
            .fire_event(
                &event("d", "occupancy", json!({"motion": true})),
                dispatcher.as_ref(),
            )
            .await;

        let calls = dispatcher.calls.lock();
        assert_eq!(calls.as_slice(), [("hue-1/hall".to_string(), "turn_on".to_string())]);
    }

    #[tokio::test]
    async fn automation_failures_do_not_inhibit_later_rules() {
        let matcher = ReflexMatcher::new();
        let mut first = motion_rule("r1");
        first.trigger.automation_id = Some("night".into());
        let mut second = motion_rule("r2");
        second.trigger.automation_id = Some("night".into());
        second.action.device_id = "lock-1/door".into();
        second.action.command = "lock".into();
        matcher.set_rules(vec![first, second]);

        // Every dispatch fails, but both rules are still attempted.
        let dispatcher = RecordingDispatcher::new(true);
        matcher.fire_automation("night", dispatcher.as_ref()).await;
        assert_eq!(dispatcher.calls.lock().len(), 2);
    }
}
