//! Adapter tools facade — the surface the reasoning layer sees.
//!
//! Listings never expose secret references or plaintext: every reference
//! in a config bag renders as a non-reversible placeholder.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use hearth_adapters::handle::{Discovery, PairOutcome};
use hearth_adapters::{AdapterHealth, LifecycleState, LogEntry, Supervisor};
use hearth_domain::adapter::{is_onboarding_id, onboarding_id, AdapterRecord, ConfigBag};
use hearth_domain::{Error, Result};
use hearth_secrets::SecretStore;

use crate::store::AdapterStore;

/// One adapter as shown to callers: config redacted, health attached.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterView {
    pub id: String,
    #[serde(rename = "type")]
    pub adapter_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub config: ConfigBag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ping: Option<DateTime<Utc>>,
}

pub struct AdapterTools {
    store: Arc<AdapterStore>,
    secrets: Arc<SecretStore>,
    supervisor: Supervisor,
}

impl AdapterTools {
    pub fn new(store: Arc<AdapterStore>, secrets: Arc<SecretStore>, supervisor: Supervisor) -> Self {
        Self {
            store,
            secrets,
            supervisor,
        }
    }

    /// List configured adapters with redacted config bags.
    pub async fn list(&self) -> Vec<AdapterView> {
        let health: BTreeMap<String, AdapterHealth> = self
            .supervisor
            .health()
            .into_iter()
            .map(|h| (h.id.clone(), h))
            .collect();

        let mut views: Vec<AdapterView> = self
            .store
            .list()
            .await
            .into_iter()
            .map(|record| {
                let h = health.get(&record.id);
                AdapterView {
                    id: record.id,
                    adapter_type: record.adapter_type,
                    display_name: record.display_name,
                    config: SecretStore::redact_bag(&record.config),
                    state: h.map(|h| h.state),
                    restart_count: h.map(|h| h.restart_count).unwrap_or(0),
                    last_ping: h.and_then(|h| h.last_ping),
                }
            })
            .collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    /// Recent log lines captured from one adapter's child.
    pub fn logs(&self, id: &str) -> Vec<LogEntry> {
        self.supervisor.logs(id)
    }

    /// Run discovery for a type, spawning an onboarding handle when no
    /// configured adapter of that type is running.
    pub async fn discover(
        &self,
        adapter_type: &str,
        params: serde_json::Value,
    ) -> Result<Discovery> {
        let target = self.dispatch_target(adapter_type).await?;
        self.supervisor.discover(&target, params).await
    }

    /// Run pairing against the same target rules as discovery.
    pub async fn pair(
        &self,
        adapter_type: &str,
        params: serde_json::Value,
    ) -> Result<PairOutcome> {
        let target = self.dispatch_target(adapter_type).await?;
        self.supervisor.pair(&target, params).await
    }

    /// Persist a new adapter record from pairing credentials. Every string
    /// credential is moved into the secret store; the record only ever
    /// carries references. Tears down the type's onboarding handle and
    /// starts the configured adapter.
    pub async fn configure_from_pairing(
        &self,
        id: &str,
        adapter_type: &str,
        display_name: Option<String>,
        credentials: BTreeMap<String, serde_json::Value>,
    ) -> Result<AdapterRecord> {
        let mut config = ConfigBag::new();
        for (key, value) in credentials {
            let stored = match value {
                serde_json::Value::String(plaintext) => serde_json::Value::String(
                    self.secrets
                        .store(&plaintext)
                        .map_err(|e| Error::Other(e.to_string()))?,
                ),
                other => other,
            };
            config.insert(key, stored);
        }

        let record = AdapterRecord {
            id: id.to_string(),
            adapter_type: adapter_type.to_string(),
            display_name,
            config,
        };
        self.store.upsert(record.clone()).await;
        self.supervisor.stop_onboarding(adapter_type).await?;
        self.supervisor.start(record.clone()).await?;
        Ok(record)
    }

    /// Delete an adapter: stop its handle, drop the record, and erase
    /// every secret its config bag references.
    pub async fn remove(&self, id: &str) -> Result<()> {
        self.supervisor.remove(id).await?;
        if let Some(record) = self.store.remove(id).await {
            self.secrets
                .delete_for_bag(&record.config)
                .map_err(|e| Error::Other(e.to_string()))?;
        }
        Ok(())
    }

    /// Where discovery/pairing for a type goes: a running configured
    /// adapter if one exists, otherwise the (possibly fresh) onboarding
    /// handle.
    async fn dispatch_target(&self, adapter_type: &str) -> Result<String> {
        let configured = self.supervisor.health().into_iter().find(|h| {
            h.adapter_type == adapter_type
                && !is_onboarding_id(&h.id)
                && h.state == LifecycleState::Running
        });
        if let Some(health) = configured {
            return Ok(health.id);
        }
        self.supervisor.start_onboarding(adapter_type).await?;
        Ok(onboarding_id(adapter_type))
    }
}
