//! Adapter handle — one live child process and all protocol traffic with it.
//!
//! The handle spawns the child with piped standard I/O, writes `init` with
//! the resolved config bag, and runs one reader task over stdout. Replies
//! are correlated strictly by request id through a pending table; a second
//! task owns the child and turns its exit into pending-request failures and
//! an exit notification. stderr is forwarded into a bounded log ring.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, oneshot, watch};

use hearth_domain::adapter::ConfigBag;
use hearth_domain::config::RequestBudgets;
use hearth_domain::entity::{EntityGroup, EntityRegistration};
use hearth_domain::event::StateChange;
use hearth_domain::property::Property;
use hearth_protocol::{
    ChildMessage, DiscoveredGateway, LogLevel, ParentMessage, PROTOCOL_VERSION,
};

use crate::registry::LaunchSpec;

/// Grace period after `shutdown` before the child is signalled.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Additional wait after SIGTERM before SIGKILL.
const STOP_TERM_GRACE: Duration = Duration::from_secs(2);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Terminal outcomes of one request: adapter error, timeout, or transport
/// failure. Callers must handle all three.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("failed to spawn adapter process: {0}")]
    Spawn(std::io::Error),

    #[error("I/O with adapter process: {0}")]
    Io(#[from] std::io::Error),

    #[error("request timed out: {op}")]
    Timeout { op: &'static str },

    #[error("adapter process exited")]
    ChildExited,

    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("unexpected reply: {0}")]
    Protocol(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Log ring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a log entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    /// A `log` protocol message.
    Child,
    /// An unparseable stdout line.
    Stdout,
    /// A stderr line.
    Stderr,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
}

/// Bounded ring of the most recent child log lines, with an optional live
/// subscriber.
pub struct LogRing {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
    subscriber: RwLock<Option<Arc<dyn Fn(&LogEntry) + Send + Sync>>>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            subscriber: RwLock::new(None),
        }
    }

    pub fn push(&self, level: LogLevel, source: LogSource, message: String) {
        let entry = LogEntry {
            at: Utc::now(),
            level,
            source,
            message,
        };
        if let Some(subscriber) = self.subscriber.read().as_ref() {
            subscriber(&entry);
        }
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Fn(&LogEntry) + Send + Sync>) {
        *self.subscriber.write() = Some(subscriber);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request/reply payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The registration payload carried by `ready`.
#[derive(Debug, Clone)]
pub struct ReadyInfo {
    pub entities: Vec<EntityRegistration>,
    pub groups: Vec<EntityGroup>,
}

#[derive(Debug, Clone)]
pub struct QueryItems {
    pub items: Vec<serde_json::Value>,
    pub total: Option<u64>,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct Discovery {
    pub gateways: Vec<DiscoveredGateway>,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PairOutcome {
    pub success: bool,
    pub credentials: Option<std::collections::BTreeMap<String, serde_json::Value>>,
    pub error: Option<String>,
    pub message: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HandleOptions {
    pub budgets: RequestBudgets,
    pub log_capacity: usize,
}

type PendingMap = HashMap<String, oneshot::Sender<Result<ChildMessage, HandleError>>>;
type ReadySlot = Arc<Mutex<Option<oneshot::Sender<Result<ReadyInfo, HandleError>>>>>;

/// One live child process.
pub struct AdapterHandle {
    adapter_id: String,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: Arc<Mutex<PendingMap>>,
    logs: Arc<LogRing>,
    alive: Arc<AtomicBool>,
    pid: Option<u32>,
    budgets: RequestBudgets,
    exit_rx: watch::Receiver<Option<i32>>,
    state_rx: Mutex<Option<mpsc::UnboundedReceiver<StateChange>>>,
}

impl AdapterHandle {
    /// Spawn the child, write `init`, and start the reader and exit tasks.
    ///
    /// Returns the handle and a one-shot that resolves on the child's
    /// `ready` (or fails on exit / pre-ready error). The caller owns the
    /// ready timeout.
    pub async fn spawn(
        adapter_id: &str,
        adapter_type: &str,
        launch: &LaunchSpec,
        config: ConfigBag,
        options: HandleOptions,
    ) -> Result<
        (
            Arc<AdapterHandle>,
            oneshot::Receiver<Result<ReadyInfo, HandleError>>,
        ),
        HandleError,
    > {
        let mut cmd = tokio::process::Command::new(&launch.program);
        cmd.args(&launch.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(HandleError::Spawn)?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or_else(|| {
            HandleError::Spawn(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            HandleError::Spawn(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            HandleError::Spawn(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stderr",
            ))
        })?;

        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let logs = Arc::new(LogRing::new(options.log_capacity));
        let alive = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = oneshot::channel();
        let ready: ReadySlot = Arc::new(Mutex::new(Some(ready_tx)));
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        let handle = Arc::new(AdapterHandle {
            adapter_id: adapter_id.to_string(),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            pending: pending.clone(),
            logs: logs.clone(),
            alive: alive.clone(),
            pid,
            budgets: options.budgets,
            exit_rx,
            state_rx: Mutex::new(Some(state_rx)),
        });

        // Reader task: one line, one message, in arrival order. EOF is the
        // authoritative death signal, so buffered lines (a pre-ready error,
        // a last reply) are always processed before anything is failed.
        {
            let id = adapter_id.to_string();
            let pending = pending.clone();
            let logs = logs.clone();
            let ready = ready.clone();
            let alive = alive.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ChildMessage>(trimmed) {
                        Ok(msg) => {
                            dispatch_message(&id, msg, &pending, &logs, &ready, &state_tx)
                        }
                        Err(_) => {
                            // Unparseable lines are log text, not errors.
                            logs.push(LogLevel::Info, LogSource::Stdout, line);
                        }
                    }
                }
                alive.store(false, Ordering::SeqCst);
                if let Some(tx) = ready.lock().take() {
                    let _ = tx.send(Err(HandleError::ChildExited));
                }
                let drained: Vec<_> = pending.lock().drain().collect();
                for (_, tx) in drained {
                    let _ = tx.send(Err(HandleError::ChildExited));
                }
            });
        }

        // stderr task: forward at error level.
        {
            let logs = logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logs.push(LogLevel::Error, LogSource::Stderr, line);
                }
            });
        }

        // Exit task: owns the child and records its exit code. Failure
        // draining belongs to the reader's EOF path.
        {
            let id = adapter_id.to_string();
            tokio::spawn(async move {
                let code = match child.wait().await {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(e) => {
                        tracing::warn!(adapter = %id, error = %e, "wait on adapter child failed");
                        -1
                    }
                };
                tracing::debug!(adapter = %id, code, "adapter child exited");
                let _ = exit_tx.send(Some(code));
            });
        }

        // Init handshake. The line carries resolved plaintext config and
        // must never reach the parent's logs.
        let init = ParentMessage::Init {
            protocol_version: PROTOCOL_VERSION,
            adapter_id: adapter_id.to_string(),
            adapter_type: adapter_type.to_string(),
            config,
        };
        handle.write_line(&init).await?;

        Ok((handle, ready_rx))
    }

    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// The exit code, once the child has exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Wait for the child to exit and return its code.
    pub async fn wait_exit(&self) -> i32 {
        let mut exit_rx = self.exit_rx.clone();
        if let Some(code) = *exit_rx.borrow() {
            return code;
        }
        let result = match exit_rx.wait_for(|c| c.is_some()).await {
            Ok(code) => (*code).unwrap_or(-1),
            Err(_) => -1,
        };
        result
    }

    /// Take the ordered stream of `state_changed` events. Yields `None`
    /// after the first call.
    pub fn take_state_changes(&self) -> Option<mpsc::UnboundedReceiver<StateChange>> {
        self.state_rx.lock().take()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.snapshot()
    }

    pub fn subscribe_logs(&self, subscriber: Arc<dyn Fn(&LogEntry) + Send + Sync>) {
        self.logs.subscribe(subscriber);
    }

    /// Number of in-flight requests.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    // ── Typed operations ───────────────────────────────────────────

    pub async fn observe(
        &self,
        entity_id: &str,
        property: Property,
    ) -> Result<serde_json::Value, HandleError> {
        let request_id = new_request_id();
        let msg = ParentMessage::Observe {
            request_id: request_id.clone(),
            entity_id: entity_id.to_string(),
            property,
        };
        let budget = Duration::from_secs(self.budgets.observe_timeout_secs);
        match self.send_request("observe", request_id, &msg, budget).await? {
            ChildMessage::ObserveResult { state, .. } => Ok(state),
            other => Err(unexpected("observe_result", &other)),
        }
    }

    pub async fn execute(
        &self,
        entity_id: &str,
        property: Property,
        command: serde_json::Value,
    ) -> Result<(), HandleError> {
        let request_id = new_request_id();
        let msg = ParentMessage::Execute {
            request_id: request_id.clone(),
            entity_id: entity_id.to_string(),
            property,
            command,
        };
        let budget = Duration::from_secs(self.budgets.execute_timeout_secs);
        match self.send_request("execute", request_id, &msg, budget).await? {
            ChildMessage::ExecuteResult { success: true, .. } => Ok(()),
            ChildMessage::ExecuteResult { error, .. } => Err(HandleError::Adapter(
                error.unwrap_or_else(|| "execute failed".into()),
            )),
            other => Err(unexpected("execute_result", &other)),
        }
    }

    pub async fn query(
        &self,
        entity_id: &str,
        property: Property,
        params: serde_json::Value,
    ) -> Result<QueryItems, HandleError> {
        let request_id = new_request_id();
        let msg = ParentMessage::Query {
            request_id: request_id.clone(),
            entity_id: entity_id.to_string(),
            property,
            params,
        };
        let budget = Duration::from_secs(self.budgets.query_timeout_secs);
        match self.send_request("query", request_id, &msg, budget).await? {
            ChildMessage::QueryResult {
                items,
                total,
                truncated,
                ..
            } => Ok(QueryItems {
                items,
                total,
                truncated: truncated.unwrap_or(false),
            }),
            other => Err(unexpected("query_result", &other)),
        }
    }

    pub async fn ping(&self) -> Result<(), HandleError> {
        let request_id = new_request_id();
        let msg = ParentMessage::Ping {
            request_id: request_id.clone(),
        };
        let budget = Duration::from_secs(self.budgets.ping_timeout_secs);
        match self.send_request("ping", request_id, &msg, budget).await? {
            ChildMessage::Pong { .. } => Ok(()),
            other => Err(unexpected("pong", &other)),
        }
    }

    pub async fn discover(&self, params: serde_json::Value) -> Result<Discovery, HandleError> {
        let request_id = new_request_id();
        let msg = ParentMessage::Discover {
            request_id: request_id.clone(),
            params,
        };
        let budget = Duration::from_secs(self.budgets.discover_timeout_secs);
        match self
            .send_request("discover", request_id, &msg, budget)
            .await?
        {
            ChildMessage::DiscoverResult {
                gateways, message, ..
            } => Ok(Discovery { gateways, message }),
            other => Err(unexpected("discover_result", &other)),
        }
    }

    pub async fn pair(&self, params: serde_json::Value) -> Result<PairOutcome, HandleError> {
        let request_id = new_request_id();
        let msg = ParentMessage::Pair {
            request_id: request_id.clone(),
            params,
        };
        let budget = Duration::from_secs(self.budgets.pair_timeout_secs);
        match self.send_request("pair", request_id, &msg, budget).await? {
            ChildMessage::PairResult {
                success,
                credentials,
                error,
                message,
                ..
            } => Ok(PairOutcome {
                success,
                credentials,
                error,
                message,
            }),
            other => Err(unexpected("pair_result", &other)),
        }
    }

    // ── Stop ───────────────────────────────────────────────────────

    /// Graceful stop: `shutdown` line, stdin close, SIGTERM after the
    /// grace period, SIGKILL after that. Returns once the child exited.
    pub async fn stop(&self) {
        let _ = self.write_line(&ParentMessage::Shutdown).await;
        {
            let mut stdin = self.stdin.lock().await;
            if let Some(mut s) = stdin.take() {
                let _ = s.shutdown().await;
            }
        }

        let mut exit_rx = self.exit_rx.clone();
        if exit_rx.borrow().is_some() {
            return;
        }
        if tokio::time::timeout(STOP_GRACE, exit_rx.wait_for(|c| c.is_some()))
            .await
            .is_ok()
        {
            return;
        }

        tracing::warn!(adapter = %self.adapter_id, "adapter ignored shutdown, sending SIGTERM");
        self.signal(Signal::Term);
        if tokio::time::timeout(STOP_TERM_GRACE, exit_rx.wait_for(|c| c.is_some()))
            .await
            .is_ok()
        {
            return;
        }

        tracing::warn!(adapter = %self.adapter_id, "adapter ignored SIGTERM, killing");
        self.signal(Signal::Kill);
        let _ = exit_rx.wait_for(|c| c.is_some()).await;
    }

    /// Immediate teardown without the shutdown handshake.
    pub async fn kill(&self) {
        {
            let mut stdin = self.stdin.lock().await;
            drop(stdin.take());
        }
        let mut exit_rx = self.exit_rx.clone();
        if exit_rx.borrow().is_some() {
            return;
        }
        self.signal(Signal::Kill);
        let _ = exit_rx.wait_for(|c| c.is_some()).await;
    }

    // ── Internals ──────────────────────────────────────────────────

    async fn send_request(
        &self,
        op: &'static str,
        request_id: String,
        msg: &ParentMessage,
        budget: Duration,
    ) -> Result<ChildMessage, HandleError> {
        if !self.is_alive() {
            return Err(HandleError::ChildExited);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        if let Err(e) = self.write_line(msg).await {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        // The child may have died between the liveness check and the
        // write (broken pipe is swallowed); don't sit out the full budget.
        if !self.is_alive() && self.pending.lock().remove(&request_id).is_some() {
            return Err(HandleError::ChildExited);
        }

        match tokio::time::timeout(budget, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a reply: the exit task drained us.
            Ok(Err(_)) => Err(HandleError::ChildExited),
            Err(_) => {
                // Erase the entry; a late reply is dropped by the reader.
                self.pending.lock().remove(&request_id);
                Err(HandleError::Timeout { op })
            }
        }
    }

    async fn write_line(&self, msg: &ParentMessage) -> Result<(), HandleError> {
        let json = serde_json::to_string(msg).map_err(|e| HandleError::Protocol(e.to_string()))?;
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(HandleError::ChildExited);
        };
        let result = async {
            stdin.write_all(json.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        match result {
            Ok(()) => Ok(()),
            // The child may have exited first; the exit task will surface it.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
            Err(e) => Err(HandleError::Io(e)),
        }
    }

    fn signal(&self, signal: Signal) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let sig = match signal {
                Signal::Term => libc::SIGTERM,
                Signal::Kill => libc::SIGKILL,
            };
            unsafe {
                libc::kill(pid as libc::pid_t, sig);
            }
        }
        #[cfg(not(unix))]
        let _ = signal;
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Route one parsed child message.
fn dispatch_message(
    adapter_id: &str,
    msg: ChildMessage,
    pending: &Mutex<PendingMap>,
    logs: &LogRing,
    ready: &ReadySlot,
    state_tx: &mpsc::UnboundedSender<StateChange>,
) {
    match msg {
        ChildMessage::Ready { entities, groups } => {
            if let Some(tx) = ready.lock().take() {
                let _ = tx.send(Ok(ReadyInfo {
                    entities,
                    groups: groups.unwrap_or_default(),
                }));
            } else {
                tracing::warn!(adapter = %adapter_id, "duplicate ready message ignored");
            }
        }
        ChildMessage::StateChanged {
            entity_id,
            property,
            state,
            previous_state,
        } => {
            let _ = state_tx.send(StateChange {
                adapter_id: adapter_id.to_string(),
                entity_id,
                property,
                state,
                previous_state,
            });
        }
        ChildMessage::Log { level, message } => {
            logs.push(level, LogSource::Child, message);
        }
        ChildMessage::Error {
            request_id: Some(request_id),
            message,
        } => {
            if let Some(tx) = pending.lock().remove(&request_id) {
                let _ = tx.send(Err(HandleError::Adapter(message)));
            } else {
                logs.push(LogLevel::Error, LogSource::Child, message);
            }
        }
        ChildMessage::Error {
            request_id: None,
            message,
        } => {
            logs.push(LogLevel::Error, LogSource::Child, message.clone());
            // An error before ready is a startup failure (e.g. a protocol
            // version mismatch reported by the child).
            if let Some(tx) = ready.lock().take() {
                let _ = tx.send(Err(HandleError::Adapter(message)));
            }
        }
        reply => {
            let Some(request_id) = reply.request_id().map(str::to_string) else {
                tracing::warn!(adapter = %adapter_id, "uncorrelatable reply dropped");
                return;
            };
            if let Some(tx) = pending.lock().remove(&request_id) {
                let _ = tx.send(Ok(reply));
            } else {
                // Late reply after a timeout, or a request id we never minted.
                tracing::warn!(
                    adapter = %adapter_id,
                    request_id = %request_id,
                    "dropping reply for unknown request"
                );
            }
        }
    }
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn unexpected(expected: &str, got: &ChildMessage) -> HandleError {
    HandleError::Protocol(format!("expected {expected}, got {got:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_ring_is_bounded() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(LogLevel::Info, LogSource::Child, format!("line {i}"));
        }
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].message, "line 2");
        assert_eq!(snapshot[2].message, "line 4");
    }

    #[test]
    fn log_ring_subscriber_sees_live_entries() {
        let ring = LogRing::new(10);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_cb = seen.clone();
        ring.subscribe(Arc::new(move |entry: &LogEntry| {
            seen_by_cb.lock().push(entry.message.clone());
        }));
        ring.push(LogLevel::Warn, LogSource::Stderr, "oops".into());
        assert_eq!(seen.lock().as_slice(), ["oops"]);
    }

    #[test]
    fn zero_capacity_ring_drops_entries() {
        let ring = LogRing::new(0);
        ring.push(LogLevel::Info, LogSource::Child, "gone".into());
        assert!(ring.snapshot().is_empty());
    }

    #[test]
    fn dispatch_completes_pending_request() {
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let logs = LogRing::new(10);
        let ready: ReadySlot = Arc::new(Mutex::new(None));
        let (state_tx, _state_rx) = mpsc::unbounded_channel();

        let (tx, mut rx) = oneshot::channel();
        pending.lock().insert("r1".into(), tx);

        dispatch_message(
            "demo-1",
            ChildMessage::Pong {
                request_id: "r1".into(),
            },
            &pending,
            &logs,
            &ready,
            &state_tx,
        );

        assert!(pending.lock().is_empty());
        let reply = rx.try_recv().unwrap().unwrap();
        assert!(matches!(reply, ChildMessage::Pong { .. }));
    }

    #[test]
    fn dispatch_routes_adapter_error_to_pending() {
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let logs = LogRing::new(10);
        let ready: ReadySlot = Arc::new(Mutex::new(None));
        let (state_tx, _state_rx) = mpsc::unbounded_channel();

        let (tx, mut rx) = oneshot::channel();
        pending.lock().insert("r2".into(), tx);

        dispatch_message(
            "demo-1",
            ChildMessage::Error {
                request_id: Some("r2".into()),
                message: "bulb unreachable".into(),
            },
            &pending,
            &logs,
            &ready,
            &state_tx,
        );

        match rx.try_recv().unwrap() {
            Err(HandleError::Adapter(msg)) => assert_eq!(msg, "bulb unreachable"),
            other => panic!("expected adapter error, got {other:?}"),
        }
    }

    #[test]
    fn dispatch_fails_ready_on_pre_ready_error() {
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let logs = LogRing::new(10);
        let (ready_tx, mut ready_rx) = oneshot::channel();
        let ready: ReadySlot = Arc::new(Mutex::new(Some(ready_tx)));
        let (state_tx, _state_rx) = mpsc::unbounded_channel();

        dispatch_message(
            "demo-1",
            ChildMessage::Error {
                request_id: None,
                message: "protocol version mismatch".into(),
            },
            &pending,
            &logs,
            &ready,
            &state_tx,
        );

        match ready_rx.try_recv().unwrap() {
            Err(HandleError::Adapter(msg)) => {
                assert!(msg.contains("version mismatch"));
            }
            other => panic!("expected startup failure, got {other:?}"),
        }
        // And the line is in the ring.
        assert_eq!(logs.snapshot().len(), 1);
    }

    #[test]
    fn dispatch_drops_unknown_reply() {
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let logs = LogRing::new(10);
        let ready: ReadySlot = Arc::new(Mutex::new(None));
        let (state_tx, _state_rx) = mpsc::unbounded_channel();

        // No pending entry for this id: must not panic, must not log-ring it.
        dispatch_message(
            "demo-1",
            ChildMessage::Pong {
                request_id: "stale".into(),
            },
            &pending,
            &logs,
            &ready,
            &state_tx,
        );
        assert!(logs.snapshot().is_empty());
    }

    #[test]
    fn dispatch_fans_out_state_changes_in_order() {
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let logs = LogRing::new(10);
        let ready: ReadySlot = Arc::new(Mutex::new(None));
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();

        for brightness in [10, 20] {
            dispatch_message(
                "demo-1",
                ChildMessage::StateChanged {
                    entity_id: "e1".into(),
                    property: Property::Illumination,
                    state: serde_json::json!({ "brightness": brightness }),
                    previous_state: None,
                },
                &pending,
                &logs,
                &ready,
                &state_tx,
            );
        }

        let first = state_rx.try_recv().unwrap();
        assert_eq!(first.adapter_id, "demo-1");
        assert_eq!(first.state["brightness"], 10);
        let second = state_rx.try_recv().unwrap();
        assert_eq!(second.state["brightness"], 20);
    }
}
