//! Daemon wiring: build shared state, connect the supervisor's callbacks
//! to the space registry and the reactive layer, and run the serve loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use hearth_adapters::{AdapterRegistry, Supervisor, SupervisorEvents};
use hearth_domain::config::Config;
use hearth_domain::event::{numeric_delta, DeviceEvent, StateChange};
use hearth_domain::property::Property;
use hearth_reactor::{CommandDispatcher, ReflexMatcher, TriageClassifier};
use hearth_secrets::SecretStore;
use hearth_spaces::SpaceRegistry;

use crate::state::{AppState, ReasoningEvent, ReasoningReceiver, ReasoningSender};
use crate::store::{AdapterStore, RuleStore, SpaceStore};

/// Routes reflex actions through the supervisor. The action's command
/// names the property the execute targets.
pub struct SupervisorDispatcher {
    supervisor: Supervisor,
}

#[async_trait]
impl CommandDispatcher for SupervisorDispatcher {
    async fn dispatch(
        &self,
        device_id: &str,
        command: &str,
        params: serde_json::Value,
    ) -> Result<(), String> {
        let (adapter_id, entity_id) = device_id
            .split_once('/')
            .ok_or_else(|| format!("malformed device id: {device_id}"))?;
        let property: Property = command
            .parse()
            .map_err(|_| format!("reflex command must name a property, got '{command}'"))?;
        self.supervisor
            .execute(adapter_id, entity_id, property, params)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Build the full daemon state and start the background event tasks.
/// Returns the state and the receiving end of the reasoning queue.
pub async fn build(config: Arc<Config>) -> anyhow::Result<(AppState, ReasoningReceiver)> {
    let state_dir = &config.state.dir;
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("cannot create state dir {}", state_dir.display()))?;

    let secrets = Arc::new(SecretStore::open(state_dir).context("opening secret store")?);
    let registry = Arc::new(AdapterRegistry::new(config.adapters.package_dirs.clone()));
    let adapters = Arc::new(AdapterStore::new(state_dir));
    let space_store = Arc::new(SpaceStore::new(state_dir));
    let rules = Arc::new(RuleStore::new(state_dir));

    let spaces = Arc::new(SpaceRegistry::new());
    let (space_rows, source_rows, property_rows) = space_store.rows().await;
    spaces.load(space_rows, source_rows, property_rows);

    let triage = Arc::new(TriageClassifier::new(config.triage.clone()));
    triage.set_rules(rules.triage_rules().await);
    let reflex = Arc::new(ReflexMatcher::new());
    reflex.set_rules(rules.reflex_rules().await);

    let (raw_tx, raw_rx) = mpsc::unbounded_channel::<StateChange>();
    let (reasoning_tx, reasoning_rx) = mpsc::unbounded_channel::<ReasoningEvent>();

    let events = SupervisorEvents {
        on_reachability_change: {
            let spaces = spaces.clone();
            Arc::new(move |adapter_id: &str, reachable: bool| {
                spaces.set_adapter_reachability(adapter_id, reachable);
            })
        },
        on_entity_registration: {
            let spaces = spaces.clone();
            Arc::new(
                move |adapter_id: &str,
                      entities: &[hearth_domain::entity::EntityRegistration],
                      _groups: &[hearth_domain::entity::EntityGroup]| {
                    spaces.apply_entity_registrations(adapter_id, entities);
                },
            )
        },
        on_state_changed: {
            let raw_tx = raw_tx.clone();
            Arc::new(move |change: StateChange| {
                let _ = raw_tx.send(change);
            })
        },
        on_execute_issued: {
            let triage = triage.clone();
            Arc::new(move |device_id: &str, command: &str| {
                triage.expect_echo(device_id, command);
            })
        },
    };

    let supervisor = Supervisor::new(
        registry.clone(),
        secrets.clone(),
        config.supervisor.clone(),
        config.requests.clone(),
        events,
    );

    let state = AppState {
        config,
        secrets,
        registry,
        supervisor: supervisor.clone(),
        spaces: spaces.clone(),
        triage: triage.clone(),
        reflex: reflex.clone(),
        adapters: adapters.clone(),
        space_store,
        rules,
        reasoning_tx: reasoning_tx.clone(),
    };

    tokio::spawn(event_pump(
        raw_rx,
        adapters,
        spaces,
        triage.clone(),
        reflex,
        Arc::new(SupervisorDispatcher { supervisor }),
        reasoning_tx.clone(),
    ));
    tokio::spawn(flush_tick(
        triage,
        reasoning_tx,
        state.config.triage.batch_tick_secs,
    ));

    Ok((state, reasoning_rx))
}

/// Turn raw state changes into device events, run the reflex matcher, and
/// route the event through triage into the reasoning queue.
async fn event_pump(
    mut raw_rx: mpsc::UnboundedReceiver<StateChange>,
    adapters: Arc<AdapterStore>,
    spaces: Arc<SpaceRegistry>,
    triage: Arc<TriageClassifier>,
    reflex: Arc<ReflexMatcher>,
    dispatcher: Arc<SupervisorDispatcher>,
    reasoning_tx: ReasoningSender,
) {
    while let Some(change) = raw_rx.recv().await {
        let device_id = DeviceEvent::device_address(&change.adapter_id, &change.entity_id);
        let device_domain = adapters
            .get(&change.adapter_id)
            .await
            .map(|r| r.adapter_type);
        let area = spaces.space_for_entity(&change.adapter_id, &change.entity_id);
        let delta = numeric_delta(&change.state, change.previous_state.as_ref());
        let event = DeviceEvent {
            device_id,
            event_type: change.property.to_string(),
            device_domain,
            area,
            data: change.state,
            delta,
            at: Utc::now(),
        };

        reflex.fire_event(&event, dispatcher.as_ref()).await;

        if let Some(immediate) = triage.ingest(event) {
            let _ = reasoning_tx.send(ReasoningEvent::Immediate(immediate));
        }
    }
}

/// Periodic drain of the triage batch buffers.
async fn flush_tick(triage: Arc<TriageClassifier>, reasoning_tx: ReasoningSender, tick_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(tick_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let flushed = triage.flush_due();
        if !flushed.is_empty() {
            let _ = reasoning_tx.send(ReasoningEvent::Flush(flushed));
        }
    }
}

/// Serve: boot everything, start configured adapters, wait for a shutdown
/// signal, then stop every handle.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let (state, mut reasoning_rx) = build(Arc::new(config)).await?;

    // Placeholder consumer at the reasoning boundary: the LLM layer is an
    // external collaborator, the daemon only owes it this queue.
    tokio::spawn(async move {
        while let Some(event) = reasoning_rx.recv().await {
            match event {
                ReasoningEvent::Immediate(e) => {
                    tracing::info!(
                        device = %e.device_id,
                        event_type = %e.event_type,
                        "event queued for reasoning"
                    );
                }
                ReasoningEvent::Flush(batch) => {
                    let events: usize = batch.iter().map(|a| a.count).sum();
                    tracing::info!(
                        devices = batch.len(),
                        events,
                        "batched events queued for reasoning"
                    );
                }
            }
        }
    });

    let records = state.adapters.list().await;
    state.supervisor.start_all(records).await;
    tracing::info!("hearth daemon running");

    shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping adapters");
    state.supervisor.stop_all().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM, using ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
