//! Persisted rows, one JSON file per table under the state directory.
//! Loaded on boot; every mutation rewrites the file off the async runtime.

use std::path::{Path, PathBuf};

use tokio::sync::RwLock;

use hearth_domain::adapter::AdapterRecord;
use hearth_domain::rules::{ReflexRule, TriageRule};
use hearth_domain::space::{SourcePropertyRow, SourceRow, SpaceRow};

fn load_rows<T: serde::de::DeserializeOwned>(path: &Path) -> Vec<T> {
    match std::fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable store file, starting empty");
                Vec::new()
            }
        },
        Err(_) => Vec::new(),
    }
}

async fn persist_rows<T: serde::Serialize>(path: PathBuf, rows: &[T]) {
    let json = match serde_json::to_string_pretty(rows) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to serialise store");
            return;
        }
    };
    let _ = tokio::task::spawn_blocking(move || {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp = path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, &path)) {
            tracing::warn!(path = %path.display(), error = %e, "failed to persist store");
        }
    })
    .await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AdapterStore {
    inner: RwLock<Vec<AdapterRecord>>,
    path: PathBuf,
}

impl AdapterStore {
    pub fn new(state_dir: &Path) -> Self {
        let path = state_dir.join("adapters.json");
        let records: Vec<AdapterRecord> = load_rows(&path);
        tracing::info!(count = records.len(), "adapter records loaded");
        Self {
            inner: RwLock::new(records),
            path,
        }
    }

    pub async fn list(&self) -> Vec<AdapterRecord> {
        self.inner.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<AdapterRecord> {
        self.inner.read().await.iter().find(|r| r.id == id).cloned()
    }

    /// Insert or replace by id.
    pub async fn upsert(&self, record: AdapterRecord) {
        {
            let mut records = self.inner.write().await;
            records.retain(|r| r.id != record.id);
            records.push(record);
        }
        self.persist().await;
    }

    pub async fn remove(&self, id: &str) -> Option<AdapterRecord> {
        let removed = {
            let mut records = self.inner.write().await;
            let removed = records.iter().find(|r| r.id == id).cloned();
            records.retain(|r| r.id != id);
            removed
        };
        if removed.is_some() {
            self.persist().await;
        }
        removed
    }

    async fn persist(&self) {
        let records = self.inner.read().await.clone();
        persist_rows(self.path.clone(), &records).await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spaces
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SpaceStore {
    spaces: RwLock<Vec<SpaceRow>>,
    sources: RwLock<Vec<SourceRow>>,
    properties: RwLock<Vec<SourcePropertyRow>>,
    dir: PathBuf,
}

impl SpaceStore {
    pub fn new(state_dir: &Path) -> Self {
        let dir = state_dir.to_path_buf();
        let spaces: Vec<SpaceRow> = load_rows(&dir.join("spaces.json"));
        let sources: Vec<SourceRow> = load_rows(&dir.join("sources.json"));
        let properties: Vec<SourcePropertyRow> = load_rows(&dir.join("source_properties.json"));
        tracing::info!(
            spaces = spaces.len(),
            sources = sources.len(),
            "space rows loaded"
        );
        Self {
            spaces: RwLock::new(spaces),
            sources: RwLock::new(sources),
            properties: RwLock::new(properties),
            dir,
        }
    }

    pub async fn rows(&self) -> (Vec<SpaceRow>, Vec<SourceRow>, Vec<SourcePropertyRow>) {
        (
            self.spaces.read().await.clone(),
            self.sources.read().await.clone(),
            self.properties.read().await.clone(),
        )
    }

    /// Replace the authored configuration wholesale.
    pub async fn replace(
        &self,
        spaces: Vec<SpaceRow>,
        sources: Vec<SourceRow>,
        properties: Vec<SourcePropertyRow>,
    ) {
        *self.spaces.write().await = spaces;
        *self.sources.write().await = sources;
        *self.properties.write().await = properties;
        let (spaces, sources, properties) = self.rows().await;
        persist_rows(self.dir.join("spaces.json"), &spaces).await;
        persist_rows(self.dir.join("sources.json"), &sources).await;
        persist_rows(self.dir.join("source_properties.json"), &properties).await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RuleStore {
    triage: RwLock<Vec<TriageRule>>,
    reflex: RwLock<Vec<ReflexRule>>,
}

impl RuleStore {
    pub fn new(state_dir: &Path) -> Self {
        let triage: Vec<TriageRule> = load_rows(&state_dir.join("triage_rules.json"));
        let reflex: Vec<ReflexRule> = load_rows(&state_dir.join("reflex_rules.json"));
        tracing::info!(
            triage = triage.len(),
            reflex = reflex.len(),
            "rule rows loaded"
        );
        Self {
            triage: RwLock::new(triage),
            reflex: RwLock::new(reflex),
        }
    }

    /// All triage rules in store order.
    pub async fn triage_rules(&self) -> Vec<TriageRule> {
        self.triage.read().await.clone()
    }

    /// Only enabled reflex rules, in store order.
    pub async fn reflex_rules(&self) -> Vec<ReflexRule> {
        self.reflex
            .read()
            .await
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use hearth_domain::adapter::ConfigBag;

    #[tokio::test]
    async fn adapter_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = AdapterStore::new(dir.path());
            store
                .upsert(AdapterRecord {
                    id: "demo-1".into(),
                    adapter_type: "demo".into(),
                    display_name: Some("Demo".into()),
                    config: ConfigBag::new(),
                })
                .await;
        }
        let store = AdapterStore::new(dir.path());
        let records = store.list().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "demo-1");
    }

    #[tokio::test]
    async fn adapter_store_upsert_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = AdapterStore::new(dir.path());
        for name in ["One", "Two"] {
            store
                .upsert(AdapterRecord {
                    id: "demo-1".into(),
                    adapter_type: "demo".into(),
                    display_name: Some(name.into()),
                    config: ConfigBag::new(),
                })
                .await;
        }
        let records = store.list().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].display_name.as_deref(), Some("Two"));
    }

    #[tokio::test]
    async fn adapter_store_remove_returns_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = AdapterStore::new(dir.path());
        store
            .upsert(AdapterRecord {
                id: "demo-1".into(),
                adapter_type: "demo".into(),
                display_name: None,
                config: ConfigBag::new(),
            })
            .await;

        let removed = store.remove("demo-1").await;
        assert_eq!(removed.unwrap().id, "demo-1");
        assert!(store.list().await.is_empty());
        assert!(store.remove("demo-1").await.is_none());
    }

    #[tokio::test]
    async fn corrupt_store_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("adapters.json"), "{{{{").unwrap();
        let store = AdapterStore::new(dir.path());
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn rule_store_filters_disabled_reflex_rules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("reflex_rules.json"),
            r#"[
                {"id": "on", "trigger": {}, "action": {"deviceId": "a/b", "command": "illumination", "params": {}}, "reason": "r", "enabled": true},
                {"id": "off", "trigger": {}, "action": {"deviceId": "a/b", "command": "illumination", "params": {}}, "reason": "r", "enabled": false}
            ]"#,
        )
        .unwrap();
        let store = RuleStore::new(dir.path());
        let rules = store.reflex_rules().await;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "on");
    }
}
