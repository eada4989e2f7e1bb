//! Supervisor — owns every adapter handle and drives its lifecycle:
//! start, liveness pings, crash detection, restart with exponential
//! backoff, onboarding handles, and cross-cutting request dispatch.
//!
//! Downstream consumers (space registry, triage) are reached only through
//! callbacks captured at construction, so handles never hold a pointer
//! back into the daemon.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use hearth_domain::adapter::{is_onboarding_id, onboarding_id, AdapterRecord, ConfigBag};
use hearth_domain::config::{RequestBudgets, SupervisorConfig};
use hearth_domain::entity::{EntityGroup, EntityRegistration};
use hearth_domain::event::{DeviceEvent, StateChange};
use hearth_domain::property::Property;
use hearth_domain::{Error, Result};
use hearth_secrets::{SecretError, SecretStore};

use crate::handle::{
    AdapterHandle, Discovery, HandleError, HandleOptions, LogEntry, PairOutcome, QueryItems,
};
use crate::registry::AdapterRegistry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A supervised child is in exactly one of these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

/// Callbacks into the rest of the daemon, captured at construction.
#[derive(Clone)]
pub struct SupervisorEvents {
    /// Running-state of an adapter changed; sources follow it.
    pub on_reachability_change: Arc<dyn Fn(&str, bool) + Send + Sync>,
    /// A child reported its registration (delivered before any state
    /// change from the same adapter).
    pub on_entity_registration:
        Arc<dyn Fn(&str, &[EntityRegistration], &[EntityGroup]) + Send + Sync>,
    /// An unsolicited state change from a running child.
    pub on_state_changed: Arc<dyn Fn(StateChange) + Send + Sync>,
    /// An execute is about to be sent; arms the triage echo window.
    pub on_execute_issued: Arc<dyn Fn(&str, &str) + Send + Sync>,
}

impl SupervisorEvents {
    /// Events that go nowhere. Test scaffolding.
    pub fn noop() -> Self {
        Self {
            on_reachability_change: Arc::new(|_: &str, _: bool| {}),
            on_entity_registration: Arc::new(
                |_: &str, _: &[EntityRegistration], _: &[EntityGroup]| {},
            ),
            on_state_changed: Arc::new(|_: StateChange| {}),
            on_execute_issued: Arc::new(|_: &str, _: &str| {}),
        }
    }
}

/// Per-adapter health snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterHealth {
    pub id: String,
    pub adapter_type: String,
    pub state: LifecycleState,
    pub restart_count: u32,
    pub ping_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ping: Option<DateTime<Utc>>,
    pub pending_requests: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Internal state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Managed {
    record: AdapterRecord,
    state: LifecycleState,
    handle: Option<Arc<AdapterHandle>>,
    registrations: Vec<EntityRegistration>,
    groups: Vec<EntityGroup>,
    backoff: Duration,
    restart_count: u32,
    restart_pending: bool,
    ping_failures: u32,
    last_ping: Option<DateTime<Utc>>,
    /// Bumped on every boot; stale tasks check it before acting.
    generation: u64,
    fanout_task: Option<JoinHandle<()>>,
    ping_task: Option<JoinHandle<()>>,
    exit_task: Option<JoinHandle<()>>,
    restart_task: Option<JoinHandle<()>>,
}

impl Managed {
    fn new(record: AdapterRecord, backoff_floor: Duration) -> Self {
        Self {
            record,
            state: LifecycleState::Stopped,
            handle: None,
            registrations: Vec::new(),
            groups: Vec::new(),
            backoff: backoff_floor,
            restart_count: 0,
            restart_pending: false,
            ping_failures: 0,
            last_ping: None,
            generation: 0,
            fanout_task: None,
            ping_task: None,
            exit_task: None,
            restart_task: None,
        }
    }

    fn abort_side_tasks(&mut self) {
        for task in [
            self.fanout_task.take(),
            self.ping_task.take(),
            self.exit_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }

    fn cancel_restart(&mut self) {
        self.restart_pending = false;
        if let Some(task) = self.restart_task.take() {
            task.abort();
        }
    }
}

struct Inner {
    registry: Arc<AdapterRegistry>,
    secrets: Arc<SecretStore>,
    config: SupervisorConfig,
    budgets: RequestBudgets,
    events: SupervisorEvents,
    managed: Mutex<HashMap<String, Managed>>,
}

/// The supervisor proper: a thin clonable front over shared state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

/// Next delay in a failure streak: doubled, capped at the ceiling.
fn next_backoff(current: Duration, ceiling: Duration) -> Duration {
    (current * 2).min(ceiling)
}

impl Supervisor {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        secrets: Arc<SecretStore>,
        config: SupervisorConfig,
        budgets: RequestBudgets,
        events: SupervisorEvents,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                secrets,
                config,
                budgets,
                events,
                managed: Mutex::new(HashMap::new()),
            }),
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Start one configured adapter. A start for an adapter that is
    /// already starting or running is a no-op.
    pub async fn start(&self, record: AdapterRecord) -> Result<()> {
        let id = record.id.clone();
        {
            let mut managed = self.inner.managed.lock();
            let floor = Duration::from_secs(self.inner.config.backoff_floor_secs);
            let entry = managed
                .entry(id.clone())
                .or_insert_with(|| Managed::new(record.clone(), floor));
            if matches!(
                entry.state,
                LifecycleState::Starting | LifecycleState::Running
            ) {
                return Ok(());
            }
            entry.record = record;
            entry.state = LifecycleState::Starting;
            entry.cancel_restart();
        }
        self.inner.boot(&id).await
    }

    /// Start every record, logging failures instead of aborting the boot.
    pub async fn start_all(&self, records: Vec<AdapterRecord>) {
        for record in records {
            let id = record.id.clone();
            if let Err(e) = self.start(record).await {
                tracing::warn!(adapter = %id, error = %e, "adapter failed to start");
            }
        }
        let running = self
            .health()
            .iter()
            .filter(|h| h.state == LifecycleState::Running)
            .count();
        tracing::info!(running, "supervisor started configured adapters");
    }

    /// Gracefully stop one adapter and cancel any pending restart.
    pub async fn stop(&self, id: &str) -> Result<()> {
        self.inner.stop_internal(id, true).await
    }

    /// Stop the adapter (if up) and start it again immediately. A restart
    /// issued while another is pending is a no-op.
    pub async fn restart(&self, id: &str) -> Result<()> {
        {
            let mut managed = self.inner.managed.lock();
            let entry = managed
                .get_mut(id)
                .ok_or_else(|| Error::AdapterNotRunning(id.to_string()))?;
            if entry.restart_pending || entry.state == LifecycleState::Starting {
                return Ok(());
            }
            // The flag guards this restart; stop_internal must not clear it.
            entry.restart_pending = true;
            if let Some(task) = entry.restart_task.take() {
                task.abort();
            }
        }
        let result = self.inner.stop_internal(id, false).await;
        {
            let mut managed = self.inner.managed.lock();
            if let Some(entry) = managed.get_mut(id) {
                entry.restart_pending = false;
                entry.state = LifecycleState::Starting;
            }
        }
        result?;
        self.inner.boot(id).await
    }

    /// Stop every handle concurrently; used on daemon shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.inner.managed.lock().keys().cloned().collect();
        let stops = ids.iter().map(|id| self.inner.stop_internal(id, true));
        for result in futures_util::future::join_all(stops).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "adapter stop failed during shutdown");
            }
        }
        tracing::info!("all adapters stopped");
    }

    /// Stop the adapter, forget its runtime state, and erase its secrets.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let _ = self.inner.stop_internal(id, true).await;
        let record = self.inner.managed.lock().remove(id).map(|m| m.record);
        if let Some(record) = record {
            self.inner
                .secrets
                .delete_for_bag(&record.config)
                .map_err(|e| Error::Other(e.to_string()))?;
        }
        Ok(())
    }

    // ── Onboarding ─────────────────────────────────────────────────

    /// Spawn a short-lived handle for interactive discovery/pairing of a
    /// type with no configured record yet. The child gets an empty config
    /// bag and is expected to register no entities.
    pub async fn start_onboarding(&self, adapter_type: &str) -> Result<()> {
        let record = AdapterRecord {
            id: onboarding_id(adapter_type),
            adapter_type: adapter_type.to_string(),
            display_name: None,
            config: ConfigBag::new(),
        };
        self.start(record).await
    }

    /// Tear down the onboarding handle of a type, if any.
    pub async fn stop_onboarding(&self, adapter_type: &str) -> Result<()> {
        let id = onboarding_id(adapter_type);
        if self.inner.managed.lock().contains_key(&id) {
            let _ = self.inner.stop_internal(&id, true).await;
            self.inner.managed.lock().remove(&id);
        }
        Ok(())
    }

    // ── Dispatch ───────────────────────────────────────────────────

    pub async fn observe(
        &self,
        id: &str,
        entity_id: &str,
        property: Property,
    ) -> Result<serde_json::Value> {
        let handle = self.inner.running_handle(id)?;
        handle
            .observe(entity_id, property)
            .await
            .map_err(|e| convert_handle_error(id, e))
    }

    pub async fn execute(
        &self,
        id: &str,
        entity_id: &str,
        property: Property,
        command: serde_json::Value,
    ) -> Result<()> {
        let handle = self.inner.running_handle(id)?;
        // Arm the echo window before the command can produce a state change.
        (self.inner.events.on_execute_issued)(
            &DeviceEvent::device_address(id, entity_id),
            property.as_str(),
        );
        handle
            .execute(entity_id, property, command)
            .await
            .map_err(|e| convert_handle_error(id, e))
    }

    pub async fn query(
        &self,
        id: &str,
        entity_id: &str,
        property: Property,
        params: serde_json::Value,
    ) -> Result<QueryItems> {
        let handle = self.inner.running_handle(id)?;
        handle
            .query(entity_id, property, params)
            .await
            .map_err(|e| convert_handle_error(id, e))
    }

    pub async fn discover(&self, id: &str, params: serde_json::Value) -> Result<Discovery> {
        let handle = self.inner.running_handle(id)?;
        handle
            .discover(params)
            .await
            .map_err(|e| convert_handle_error(id, e))
    }

    pub async fn pair(&self, id: &str, params: serde_json::Value) -> Result<PairOutcome> {
        let handle = self.inner.running_handle(id)?;
        handle
            .pair(params)
            .await
            .map_err(|e| convert_handle_error(id, e))
    }

    // ── Introspection ──────────────────────────────────────────────

    pub fn state(&self, id: &str) -> Option<LifecycleState> {
        self.inner.managed.lock().get(id).map(|m| m.state)
    }

    pub fn health(&self) -> Vec<AdapterHealth> {
        let managed = self.inner.managed.lock();
        let mut health: Vec<AdapterHealth> = managed
            .values()
            .map(|m| AdapterHealth {
                id: m.record.id.clone(),
                adapter_type: m.record.adapter_type.clone(),
                state: m.state,
                restart_count: m.restart_count,
                ping_failures: m.ping_failures,
                last_ping: m.last_ping,
                pending_requests: m.handle.as_ref().map(|h| h.pending_count()).unwrap_or(0),
            })
            .collect();
        health.sort_by(|a, b| a.id.cmp(&b.id));
        health
    }

    /// The entity registrations cached from the adapter's last `ready`.
    pub fn registrations(&self, id: &str) -> Vec<EntityRegistration> {
        self.inner
            .managed
            .lock()
            .get(id)
            .map(|m| m.registrations.clone())
            .unwrap_or_default()
    }

    pub fn groups(&self, id: &str) -> Vec<EntityGroup> {
        self.inner
            .managed
            .lock()
            .get(id)
            .map(|m| m.groups.clone())
            .unwrap_or_default()
    }

    /// Recent log lines captured from the child.
    pub fn logs(&self, id: &str) -> Vec<LogEntry> {
        self.inner
            .managed
            .lock()
            .get(id)
            .and_then(|m| m.handle.as_ref().map(|h| h.logs()))
            .unwrap_or_default()
    }
}

impl Inner {
    fn running_handle(self: &Arc<Self>, id: &str) -> Result<Arc<AdapterHandle>> {
        let managed = self.managed.lock();
        let entry = managed
            .get(id)
            .ok_or_else(|| Error::AdapterNotRunning(id.to_string()))?;
        match (entry.state, &entry.handle) {
            (LifecycleState::Running, Some(handle)) => Ok(handle.clone()),
            _ => Err(Error::AdapterNotRunning(id.to_string())),
        }
    }

    /// Spawn the child for an entry already marked `Starting`, await its
    /// registration, and promote it to `Running`.
    async fn boot(self: &Arc<Self>, id: &str) -> Result<()> {
        let record = {
            let managed = self.managed.lock();
            match managed.get(id) {
                Some(entry) => entry.record.clone(),
                None => return Err(Error::AdapterNotRunning(id.to_string())),
            }
        };

        // Non-retryable aborts: unknown type, unknown secret reference.
        let launch = match self.registry.resolve(&record.adapter_type) {
            Ok(launch) => launch,
            Err(e) => {
                self.mark_stopped(id);
                return Err(e);
            }
        };
        let config = match self.secrets.resolve_bag(&record.config) {
            Ok(config) => config,
            Err(SecretError::UnknownReference(reference)) => {
                self.mark_stopped(id);
                return Err(Error::UnknownSecretReference(reference));
            }
            Err(e) => {
                self.mark_stopped(id);
                return Err(Error::Other(e.to_string()));
            }
        };

        let generation = {
            let mut managed = self.managed.lock();
            let Some(entry) = managed.get_mut(id) else {
                return Err(Error::AdapterNotRunning(id.to_string()));
            };
            entry.generation += 1;
            entry.generation
        };

        tracing::info!(adapter = %id, adapter_type = %record.adapter_type, "starting adapter");

        let options = HandleOptions {
            budgets: self.budgets.clone(),
            log_capacity: self.config.log_ring_capacity,
        };
        let spawned =
            AdapterHandle::spawn(id, &record.adapter_type, &launch, config, options).await;
        let (handle, ready_rx) = match spawned {
            Ok(pair) => pair,
            Err(e) => {
                self.fail_start(id, generation, true);
                return Err(Error::Adapter {
                    adapter: id.to_string(),
                    message: e.to_string(),
                });
            }
        };

        {
            let mut managed = self.managed.lock();
            if let Some(entry) = managed.get_mut(id) {
                entry.handle = Some(handle.clone());
            }
        }

        let start_budget = Duration::from_secs(self.config.start_timeout_secs);
        match tokio::time::timeout(start_budget, ready_rx).await {
            Ok(Ok(Ok(info))) => {
                self.promote(id, generation, handle, info.entities, info.groups);
                Ok(())
            }
            Ok(Ok(Err(HandleError::Adapter(message)))) => {
                // The child refused init (e.g. protocol version mismatch):
                // a startup failure with no retry.
                handle.kill().await;
                self.fail_start(id, generation, false);
                Err(Error::Adapter {
                    adapter: id.to_string(),
                    message,
                })
            }
            Ok(Ok(Err(_))) | Ok(Err(_)) => {
                handle.kill().await;
                self.fail_start(id, generation, true);
                Err(Error::ExitedBeforeReady(id.to_string()))
            }
            Err(_) => {
                handle.kill().await;
                self.fail_start(id, generation, true);
                Err(Error::Timeout(format!("adapter {id} did not become ready")))
            }
        }
    }

    /// Promote a freshly-ready handle to running: cache registrations,
    /// reset backoff, deliver registration before any state change, then
    /// start the fan-out, ping and exit-monitor tasks.
    fn promote(
        self: &Arc<Self>,
        id: &str,
        generation: u64,
        handle: Arc<AdapterHandle>,
        entities: Vec<EntityRegistration>,
        groups: Vec<EntityGroup>,
    ) {
        let adapter_type = {
            let mut managed = self.managed.lock();
            let Some(entry) = managed.get_mut(id) else {
                drop(managed);
                tokio::spawn(async move { handle.kill().await });
                return;
            };
            if entry.generation != generation {
                // Superseded by a newer boot; this child must not linger.
                drop(managed);
                tokio::spawn(async move { handle.kill().await });
                return;
            }
            entry.state = LifecycleState::Running;
            entry.backoff = Duration::from_secs(self.config.backoff_floor_secs);
            entry.ping_failures = 0;
            entry.registrations = entities.clone();
            entry.groups = groups.clone();
            entry.record.adapter_type.clone()
        };

        tracing::info!(
            adapter = %id,
            entities = entities.len(),
            groups = groups.len(),
            "adapter ready"
        );
        (self.events.on_entity_registration)(id, &entities, &groups);
        (self.events.on_reachability_change)(id, true);

        // State fan-out starts only after the registration was delivered,
        // so ready always precedes state for the same adapter.
        let fanout_task = handle.take_state_changes().map(|mut state_rx| {
            let on_state_changed = self.events.on_state_changed.clone();
            tokio::spawn(async move {
                while let Some(change) = state_rx.recv().await {
                    on_state_changed(change);
                }
            })
        });

        let ping_task = tokio::spawn(ping_loop(
            self.clone(),
            id.to_string(),
            generation,
            handle.clone(),
        ));
        let exit_task = tokio::spawn(exit_monitor(
            self.clone(),
            id.to_string(),
            generation,
            handle,
        ));

        {
            let mut managed = self.managed.lock();
            if let Some(entry) = managed.get_mut(id) {
                entry.fanout_task = fanout_task;
                entry.ping_task = Some(ping_task);
                entry.exit_task = Some(exit_task);
            }
        }

        // The first persistent adapter of a type supersedes its
        // onboarding handle.
        if !is_onboarding_id(id) {
            let onboarding = onboarding_id(&adapter_type);
            if self.managed.lock().contains_key(&onboarding) {
                let inner = self.clone();
                tokio::spawn(async move {
                    tracing::info!(adapter = %onboarding, "tearing down onboarding handle");
                    let _ = inner.stop_internal(&onboarding, true).await;
                    inner.managed.lock().remove(&onboarding);
                });
            }
        }
    }

    /// Mark a failed boot and, when the failure is retryable, schedule the
    /// next attempt.
    fn fail_start(self: &Arc<Self>, id: &str, generation: u64, retry: bool) {
        {
            let mut managed = self.managed.lock();
            let Some(entry) = managed.get_mut(id) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            entry.state = LifecycleState::Crashed;
            entry.handle = None;
            entry.abort_side_tasks();
        }
        if retry {
            self.schedule_restart(id);
        }
    }

    fn mark_stopped(self: &Arc<Self>, id: &str) {
        if let Some(entry) = self.managed.lock().get_mut(id) {
            entry.state = LifecycleState::Stopped;
            entry.handle = None;
        }
    }

    /// Queue a restart after the current backoff delay, doubling it for
    /// the next failure. A second call while one is pending is a no-op.
    fn schedule_restart(self: &Arc<Self>, id: &str) {
        let delay = {
            let mut managed = self.managed.lock();
            let Some(entry) = managed.get_mut(id) else {
                return;
            };
            if entry.restart_pending {
                return;
            }
            entry.restart_pending = true;
            entry.restart_count += 1;
            let delay = entry.backoff;
            let ceiling = Duration::from_secs(self.config.backoff_ceiling_secs);
            entry.backoff = next_backoff(entry.backoff, ceiling);
            delay
        };

        tracing::info!(adapter = %id, delay_secs = delay.as_secs(), "restart scheduled");

        let inner = self.clone();
        let task_id = id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut managed = inner.managed.lock();
                let Some(entry) = managed.get_mut(&task_id) else {
                    return;
                };
                if !entry.restart_pending {
                    return; // cancelled by an explicit stop
                }
                entry.restart_pending = false;
                entry.restart_task = None;
                entry.state = LifecycleState::Starting;
            }
            if let Err(e) = inner.boot(&task_id).await {
                tracing::warn!(adapter = %task_id, error = %e, "adapter restart failed");
            }
        });

        if let Some(entry) = self.managed.lock().get_mut(id) {
            entry.restart_task = Some(task);
        }
    }

    async fn stop_internal(self: &Arc<Self>, id: &str, cancel_restart: bool) -> Result<()> {
        let handle = {
            let mut managed = self.managed.lock();
            let Some(entry) = managed.get_mut(id) else {
                return Ok(());
            };
            if cancel_restart {
                entry.cancel_restart();
            }
            entry.abort_side_tasks();
            entry.state = LifecycleState::Stopping;
            entry.handle.take()
        };

        if let Some(handle) = handle {
            handle.stop().await;
        }

        if let Some(entry) = self.managed.lock().get_mut(id) {
            entry.state = LifecycleState::Stopped;
        }
        (self.events.on_reachability_change)(id, false);
        tracing::info!(adapter = %id, "adapter stopped");
        Ok(())
    }
}

/// Liveness pings: one per running handle. Three consecutive failures
/// recycle the handle.
async fn ping_loop(inner: Arc<Inner>, id: String, generation: u64, handle: Arc<AdapterHandle>) {
    let interval = Duration::from_secs(inner.config.ping_interval_secs);
    loop {
        tokio::time::sleep(interval).await;
        match handle.ping().await {
            Ok(()) => {
                let mut managed = inner.managed.lock();
                let Some(entry) = managed.get_mut(&id) else {
                    return;
                };
                if entry.generation != generation {
                    return;
                }
                entry.ping_failures = 0;
                entry.last_ping = Some(Utc::now());
            }
            Err(e) => {
                let strikes = {
                    let mut managed = inner.managed.lock();
                    let Some(entry) = managed.get_mut(&id) else {
                        return;
                    };
                    if entry.generation != generation {
                        return;
                    }
                    entry.ping_failures += 1;
                    entry.ping_failures
                };
                tracing::warn!(adapter = %id, strikes, error = %e, "adapter ping failed");
                if strikes >= inner.config.ping_failure_limit {
                    let stale = {
                        let mut managed = inner.managed.lock();
                        let Some(entry) = managed.get_mut(&id) else {
                            return;
                        };
                        if entry.generation != generation {
                            return;
                        }
                        // Keep this task out of the abort set; it returns
                        // on its own below.
                        entry.ping_task = None;
                        entry.abort_side_tasks();
                        entry.state = LifecycleState::Crashed;
                        entry.handle.take()
                    };
                    if let Some(handle) = stale {
                        handle.stop().await;
                    }
                    (inner.events.on_reachability_change)(&id, false);
                    inner.schedule_restart(&id);
                    return;
                }
            }
        }
    }
}

/// Watches for an unexpected child exit while running.
async fn exit_monitor(inner: Arc<Inner>, id: String, generation: u64, handle: Arc<AdapterHandle>) {
    let code = handle.wait_exit().await;
    let crashed = {
        let mut managed = inner.managed.lock();
        let Some(entry) = managed.get_mut(&id) else {
            return;
        };
        if entry.generation != generation || entry.state != LifecycleState::Running {
            return;
        }
        entry.exit_task = None;
        entry.abort_side_tasks();
        entry.state = LifecycleState::Crashed;
        entry.handle = None;
        true
    };
    if crashed {
        tracing::warn!(adapter = %id, code, "adapter crashed");
        (inner.events.on_reachability_change)(&id, false);
        inner.schedule_restart(&id);
    }
}

fn convert_handle_error(id: &str, e: HandleError) -> Error {
    match e {
        HandleError::Timeout { op } => Error::Timeout(format!("{op} on adapter {id}")),
        HandleError::Adapter(message) => Error::Adapter {
            adapter: id.to_string(),
            message,
        },
        HandleError::ChildExited => Error::AdapterNotRunning(id.to_string()),
        other => Error::Adapter {
            adapter: id.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_supervisor() -> (Supervisor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor_in(&dir);
        (supervisor, dir)
    }

    fn supervisor_in(dir: &tempfile::TempDir) -> Supervisor {
        let registry = Arc::new(AdapterRegistry::new(vec![dir.path().join("packages")]));
        let secrets = Arc::new(SecretStore::open(dir.path()).unwrap());
        Supervisor::new(
            registry,
            secrets,
            SupervisorConfig::default(),
            RequestBudgets::default(),
            SupervisorEvents::noop(),
        )
    }

    #[test]
    fn backoff_doubles_to_ceiling() {
        let ceiling = Duration::from_secs(60);
        let mut delay = Duration::from_secs(2);
        let mut observed = Vec::new();
        for _ in 0..7 {
            observed.push(delay.as_secs());
            delay = next_backoff(delay, ceiling);
        }
        assert_eq!(observed, vec![2, 4, 8, 16, 32, 60, 60]);
    }

    #[tokio::test]
    async fn start_of_unknown_type_aborts_without_retry() {
        let (supervisor, _dir) = test_supervisor();
        let record = AdapterRecord {
            id: "ghost-1".into(),
            adapter_type: "ghost".into(),
            display_name: None,
            config: ConfigBag::new(),
        };
        let err = supervisor.start(record).await.unwrap_err();
        assert!(matches!(err, Error::UnknownAdapterType(_)));
        assert_eq!(supervisor.state("ghost-1"), Some(LifecycleState::Stopped));
        // No restart was queued.
        assert!(!supervisor.inner.managed.lock()["ghost-1"].restart_pending);
    }

    #[tokio::test]
    async fn start_with_unknown_secret_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("packages/demo");
        std::fs::create_dir_all(&package).unwrap();
        std::fs::write(
            package.join("adapter.json"),
            r#"{"type": "demo", "entry": "run.sh"}"#,
        )
        .unwrap();
        let supervisor = supervisor_in(&dir);

        let mut config = ConfigBag::new();
        config.insert(
            "api_key".into(),
            serde_json::json!("$secret:0123456789abcdef"),
        );
        let record = AdapterRecord {
            id: "demo-1".into(),
            adapter_type: "demo".into(),
            display_name: None,
            config,
        };
        let err = supervisor.start(record).await.unwrap_err();
        assert!(matches!(err, Error::UnknownSecretReference(_)));
        assert_eq!(supervisor.state("demo-1"), Some(LifecycleState::Stopped));
        assert!(!supervisor.inner.managed.lock()["demo-1"].restart_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn second_scheduled_restart_is_a_no_op() {
        let (supervisor, _dir) = test_supervisor();
        {
            let mut managed = supervisor.inner.managed.lock();
            managed.insert(
                "demo-1".into(),
                Managed::new(
                    AdapterRecord {
                        id: "demo-1".into(),
                        adapter_type: "demo".into(),
                        display_name: None,
                        config: ConfigBag::new(),
                    },
                    Duration::from_secs(2),
                ),
            );
        }

        supervisor.inner.schedule_restart("demo-1");
        supervisor.inner.schedule_restart("demo-1");

        let managed = supervisor.inner.managed.lock();
        let entry = &managed["demo-1"];
        assert!(entry.restart_pending);
        // Only the first call took effect.
        assert_eq!(entry.restart_count, 1);
        assert_eq!(entry.backoff, Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_a_pending_restart() {
        let (supervisor, _dir) = test_supervisor();
        {
            let mut managed = supervisor.inner.managed.lock();
            managed.insert(
                "demo-1".into(),
                Managed::new(
                    AdapterRecord {
                        id: "demo-1".into(),
                        adapter_type: "demo".into(),
                        display_name: None,
                        config: ConfigBag::new(),
                    },
                    Duration::from_secs(2),
                ),
            );
        }
        supervisor.inner.schedule_restart("demo-1");
        supervisor.stop("demo-1").await.unwrap();

        let managed = supervisor.inner.managed.lock();
        let entry = &managed["demo-1"];
        assert!(!entry.restart_pending);
        assert_eq!(entry.state, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn dispatch_against_unmanaged_adapter_fails_fast() {
        let (supervisor, _dir) = test_supervisor();
        let err = supervisor
            .observe("nope-1", "e1", Property::Illumination)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AdapterNotRunning(_)));
    }

    #[test]
    fn health_is_sorted_and_complete() {
        let (supervisor, _dir) = test_supervisor();
        {
            let mut managed = supervisor.inner.managed.lock();
            for id in ["zeta-1", "alpha-1"] {
                managed.insert(
                    id.into(),
                    Managed::new(
                        AdapterRecord {
                            id: id.into(),
                            adapter_type: "demo".into(),
                            display_name: None,
                            config: ConfigBag::new(),
                        },
                        Duration::from_secs(2),
                    ),
                );
            }
        }
        let health = supervisor.health();
        assert_eq!(health.len(), 2);
        assert_eq!(health[0].id, "alpha-1");
        assert_eq!(health[1].id, "zeta-1");
        assert_eq!(health[0].state, LifecycleState::Stopped);
    }
}
