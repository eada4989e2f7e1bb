//! Adapter package manifest — one `adapter.json` per package directory.
//!
//! ```json
//! {
//!   "type": "hue",
//!   "entry": "dist/index.js",
//!   "multiInstance": true,
//!   "setup": {
//!     "discover": { "description": "Find Hue bridges on the local network" },
//!     "pair": { "description": "Press the link button, then pair" }
//!   }
//! }
//! ```
//!
//! Unknown keys are ignored; `multiInstance` defaults to `false`.

use serde::{Deserialize, Serialize};

/// Well-known manifest file name inside a package directory.
pub const MANIFEST_FILE: &str = "adapter.json";

/// Parsed adapter manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterManifest {
    /// The key adapter records reference.
    #[serde(rename = "type")]
    pub adapter_type: String,
    /// Path to the executable module, relative to the manifest.
    pub entry: String,
    #[serde(default)]
    pub multi_instance: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupCapabilities>,
}

/// Optional interactive-onboarding capabilities an adapter declares.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discover: Option<SetupStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair: Option<SetupStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupStep {
    pub description: String,
}

impl AdapterManifest {
    /// Fatal problems that make a manifest unusable. Non-fatal oddities
    /// are left to the caller's logs.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.adapter_type.trim().is_empty() {
            errors.push("missing required field: type".into());
        }
        if self.entry.trim().is_empty() {
            errors.push("missing required field: entry".into());
        }
        if std::path::Path::new(&self.entry).is_absolute() {
            errors.push(format!("entry must be relative to the manifest: {}", self.entry));
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_manifest_parses() {
        let m: AdapterManifest =
            serde_json::from_str(r#"{"type": "demo", "entry": "dist/index.js"}"#).unwrap();
        assert_eq!(m.adapter_type, "demo");
        assert!(!m.multi_instance);
        assert!(m.setup.is_none());
        assert!(m.validate().is_empty());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let m: AdapterManifest = serde_json::from_str(
            r#"{"type": "demo", "entry": "main.py", "author": "someone", "homepage": "x"}"#,
        )
        .unwrap();
        assert_eq!(m.entry, "main.py");
    }

    #[test]
    fn setup_capabilities_parse() {
        let m: AdapterManifest = serde_json::from_str(
            r#"{
                "type": "gate",
                "entry": "run.sh",
                "multiInstance": true,
                "setup": {
                    "discover": {"description": "Scan for gateways"},
                    "pair": {"description": "Exchange credentials"}
                }
            }"#,
        )
        .unwrap();
        assert!(m.multi_instance);
        let setup = m.setup.unwrap();
        assert!(setup.discover.is_some());
        assert!(setup.pair.is_some());
    }

    #[test]
    fn empty_fields_fail_validation() {
        let m: AdapterManifest =
            serde_json::from_str(r#"{"type": " ", "entry": ""}"#).unwrap();
        let errors = m.validate();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn absolute_entry_fails_validation() {
        let m: AdapterManifest =
            serde_json::from_str(r#"{"type": "demo", "entry": "/usr/bin/env"}"#).unwrap();
        assert_eq!(m.validate().len(), 1);
    }
}
