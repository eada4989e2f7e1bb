//! Adapter wire protocol: the line-delimited JSON messages spoken between
//! the daemon and an adapter child process over its standard I/O.
//!
//! Each direction is a stream of one JSON object per line, UTF-8, newline
//! terminated. Messages are a closed sum tagged by `type`; a line whose tag
//! is unknown fails parsing and is recorded as log text by the reader, not
//! dropped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use hearth_domain::adapter::ConfigBag;
use hearth_domain::entity::{EntityGroup, EntityRegistration};
use hearth_domain::property::Property;

/// Protocol revision, compared on `init`. A child that speaks a different
/// revision must emit an `error` and exit.
pub const PROTOCOL_VERSION: u32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parent → child
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Messages written by the daemon onto a child's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ParentMessage {
    /// Sent exactly once after spawn, carrying the resolved config bag.
    Init {
        protocol_version: u32,
        adapter_id: String,
        adapter_type: String,
        config: ConfigBag,
    },
    Observe {
        request_id: String,
        entity_id: String,
        property: Property,
    },
    Execute {
        request_id: String,
        entity_id: String,
        property: Property,
        command: serde_json::Value,
    },
    Query {
        request_id: String,
        entity_id: String,
        property: Property,
        params: serde_json::Value,
    },
    Ping {
        request_id: String,
    },
    Discover {
        request_id: String,
        params: serde_json::Value,
    },
    Pair {
        request_id: String,
        params: serde_json::Value,
    },
    Shutdown,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Child → parent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Messages read from a child's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChildMessage {
    /// Sent exactly once after a successful `init`.
    Ready {
        entities: Vec<EntityRegistration>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        groups: Option<Vec<EntityGroup>>,
    },
    ObserveResult {
        request_id: String,
        state: serde_json::Value,
    },
    ExecuteResult {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    QueryResult {
        request_id: String,
        items: Vec<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        truncated: Option<bool>,
    },
    Pong {
        request_id: String,
    },
    DiscoverResult {
        request_id: String,
        gateways: Vec<DiscoveredGateway>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    PairResult {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<BTreeMap<String, serde_json::Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Unsolicited; may arrive at any time after `ready`.
    StateChanged {
        entity_id: String,
        property: Property,
        state: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_state: Option<serde_json::Value>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },
    Log {
        level: LogLevel,
        message: String,
    },
}

impl ChildMessage {
    /// The request id a reply correlates to, when the message is a reply.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ChildMessage::ObserveResult { request_id, .. }
            | ChildMessage::ExecuteResult { request_id, .. }
            | ChildMessage::QueryResult { request_id, .. }
            | ChildMessage::Pong { request_id }
            | ChildMessage::DiscoverResult { request_id, .. }
            | ChildMessage::PairResult { request_id, .. } => Some(request_id),
            ChildMessage::Error { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

/// A gateway found during interactive discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredGateway {
    pub id: String,
    pub name: String,
    pub address: String,
}

/// Severity of a child log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn init_serialises_with_camel_case_fields() {
        let msg = ParentMessage::Init {
            protocol_version: PROTOCOL_VERSION,
            adapter_id: "demo-1".into(),
            adapter_type: "demo".into(),
            config: ConfigBag::new(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "init");
        assert_eq!(value["protocolVersion"], 1);
        assert_eq!(value["adapterId"], "demo-1");
    }

    #[test]
    fn observe_round_trips() {
        let msg = ParentMessage::Observe {
            request_id: "r1".into(),
            entity_id: "e1".into(),
            property: Property::Illumination,
        };
        let line = serde_json::to_string(&msg).unwrap();
        assert!(line.contains("\"requestId\":\"r1\""));
        let back: ParentMessage = serde_json::from_str(&line).unwrap();
        assert!(matches!(back, ParentMessage::Observe { .. }));
    }

    #[test]
    fn ready_parses_registration_payload() {
        let line = r#"{
            "type": "ready",
            "entities": [
                {"entityId": "e1", "properties": [{"property": "illumination", "features": ["dimmable"]}]}
            ],
            "groups": [{"id": "g1", "name": "Hall", "type": "zone", "entityIds": ["e1"]}]
        }"#;
        let msg: ChildMessage = serde_json::from_str(line).unwrap();
        match msg {
            ChildMessage::Ready { entities, groups } => {
                assert_eq!(entities.len(), 1);
                assert_eq!(entities[0].entity_id, "e1");
                assert_eq!(groups.unwrap()[0].name, "Hall");
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn reply_request_ids_are_extracted() {
        let pong: ChildMessage =
            serde_json::from_str(r#"{"type": "pong", "requestId": "r9"}"#).unwrap();
        assert_eq!(pong.request_id(), Some("r9"));

        let state: ChildMessage = serde_json::from_str(
            r#"{"type": "state_changed", "entityId": "e1", "property": "climate", "state": {"temp": 21.0}}"#,
        )
        .unwrap();
        assert_eq!(state.request_id(), None);

        let err: ChildMessage =
            serde_json::from_str(r#"{"type": "error", "message": "boom"}"#).unwrap();
        assert_eq!(err.request_id(), None);
    }

    #[test]
    fn unknown_tag_is_rejected_at_the_boundary() {
        let result = serde_json::from_str::<ChildMessage>(r#"{"type": "telepathy"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn state_changed_previous_state_is_optional() {
        let with: ChildMessage = serde_json::from_str(
            r#"{"type": "state_changed", "entityId": "e1", "property": "power",
                "state": {"watts": 10}, "previousState": {"watts": 12}}"#,
        )
        .unwrap();
        match with {
            ChildMessage::StateChanged { previous_state, .. } => {
                assert_eq!(previous_state, Some(json!({"watts": 12})));
            }
            other => panic!("expected state_changed, got {other:?}"),
        }
    }
}
