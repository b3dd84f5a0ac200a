//! In-process durable execution engine.
//!
//! The runtime owns the history store, drives one execution loop per active
//! instance, and farms activity work out to a parallel worker pool. Each
//! wake-up replays the orchestration from the start against recorded history
//! (cost is O(history length), which equals the number of workflow steps),
//! commits the new decisions, dispatches unresolved tasks, and suspends until
//! a completion arrives.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::providers::{self, HistoryRecord, HistoryStore, StoreError};
use crate::{run_turn, ActivityError, ErrorKind, Event};

pub mod activity;
pub mod registry;
pub mod router;

use activity::{ActivityWorkItem, ActivityWorker};
use registry::{ActivityRegistry, OrchestrationRegistry};
use router::{InstanceRouter, OrchestratorMsg};

/// Configuration options for the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Maximum dispatch attempts per task before its failure commits.
    pub max_attempts: u32,
    /// Base delay between redispatches of a transiently failed task;
    /// multiplied by the attempt number.
    pub retry_backoff_ms: u64,
    /// Default per-activity timeout. `None` disables timeouts.
    pub activity_timeout_ms: Option<u64>,
    /// Poll interval for the status wait helpers.
    pub poll_interval_ms: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_ms: 50,
            activity_timeout_ms: None,
            poll_interval_ms: 10,
        }
    }
}

/// High-level instance status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Pending,
    Running,
    Completed { output: String },
    Failed { error: ActivityError },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }
}

/// Status plus record timestamps, the client-facing query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: OrchestrationStatus,
    pub created_ms: Option<u64>,
    pub updated_ms: Option<u64>,
}

/// Derive status purely from recorded history.
pub fn status_of(records: &[HistoryRecord]) -> OrchestrationStatus {
    if records.is_empty() {
        return OrchestrationStatus::Pending;
    }
    for r in records.iter().rev() {
        match &r.event {
            Event::OrchestratorCompleted { result } => {
                return OrchestrationStatus::Completed { output: result.clone() };
            }
            Event::OrchestratorFailed { error } => {
                return OrchestrationStatus::Failed { error: error.clone() };
            }
            Event::OrchestratorTerminated { reason } => {
                return OrchestrationStatus::Terminated { reason: reason.clone() };
            }
            _ => {}
        }
    }
    OrchestrationStatus::Running
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("unknown orchestration: {0}")]
    UnknownOrchestration(String),
    #[error("instance already exists: {0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error type returned by the orchestration wait helper.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for orchestration")]
    Timeout,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The durable execution engine.
pub struct Runtime {
    store: Arc<dyn HistoryStore>,
    orchestrations: OrchestrationRegistry,
    options: RuntimeOptions,
    router: Arc<InstanceRouter>,
    work_tx: mpsc::UnboundedSender<ActivityWorkItem>,
    active: Mutex<HashSet<String>>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Start a runtime with default options.
    pub async fn start_with_store(
        store: Arc<dyn HistoryStore>,
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(store, activities, orchestrations, RuntimeOptions::default()).await
    }

    /// Start a runtime with custom options. Rehydrates every non-terminal
    /// instance found in the store, so a restarted process resumes in-flight
    /// work from history.
    pub async fn start_with_options(
        store: Arc<dyn HistoryStore>,
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times).
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let runtime = Arc::new(Self {
            store,
            orchestrations,
            options,
            router: Arc::new(InstanceRouter::default()),
            work_tx,
            active: Mutex::new(HashSet::new()),
            joins: Mutex::new(Vec::new()),
        });

        let worker = ActivityWorker::new(activities, completion_tx);
        let worker_handle = tokio::spawn(worker.run(work_rx));
        let router_handle = runtime.clone().start_completion_router(completion_rx);
        {
            let mut joins = runtime.joins.lock().await;
            joins.push(worker_handle);
            joins.push(router_handle);
        }

        runtime.rehydrate().await;
        runtime
    }

    fn start_completion_router(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<OrchestratorMsg>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                self.router.forward(msg).await;
            }
        })
    }

    /// Reactivate every instance whose history is non-terminal.
    async fn rehydrate(self: &Arc<Self>) {
        let instances = match self.store.list_instances().await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "rehydrate: cannot list instances");
                return;
            }
        };
        for instance in instances {
            let records = match self.store.read(&instance).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(instance = %instance, error = %e, "rehydrate: skipping unreadable instance");
                    continue;
                }
            };
            match status_of(&records) {
                OrchestrationStatus::Running => {
                    debug!(instance = %instance, "rehydrate: resuming instance");
                    self.activate(instance).await;
                }
                OrchestrationStatus::Pending => {
                    warn!(instance = %instance, "rehydrate: instance has no start event, leaving pending");
                }
                _ => {}
            }
        }
    }

    /// Start a new orchestration instance. The start event is committed
    /// before activation, so a crash right after this call still resumes.
    pub async fn start_orchestration(
        self: &Arc<Self>,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), StartError> {
        if !self.orchestrations.has(orchestration) {
            return Err(StartError::UnknownOrchestration(orchestration.to_string()));
        }
        match self.store.create_instance(instance).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(id)) => return Err(StartError::AlreadyExists(id)),
            Err(e) => return Err(e.into()),
        }
        self.store
            .append(
                instance,
                0,
                vec![Event::OrchestratorStarted {
                    name: orchestration.to_string(),
                    input: input.into(),
                }],
            )
            .await?;
        self.activate(instance.to_string()).await;
        Ok(())
    }

    /// Request termination of a running instance. Best effort: in-flight
    /// activities are signalled but not guaranteed to stop.
    pub async fn terminate(&self, instance: &str, reason: impl Into<String>) {
        self.router
            .forward(OrchestratorMsg::Terminate {
                instance: instance.to_string(),
                reason: reason.into(),
            })
            .await;
    }

    /// Current status for an instance; `NotFound` for unknown ids.
    pub async fn get_orchestration_status(&self, instance: &str) -> OrchestrationStatus {
        match self.store.read(instance).await {
            Ok(records) => status_of(&records),
            Err(_) => OrchestrationStatus::NotFound,
        }
    }

    /// Status plus created/last-updated times.
    pub async fn get_status_report(&self, instance: &str) -> Result<StatusReport, StoreError> {
        let records = self.store.read(instance).await?;
        Ok(StatusReport {
            status: status_of(&records),
            created_ms: records.first().map(|r| r.ts_ms),
            updated_ms: records.last().map(|r| r.ts_ms),
        })
    }

    /// Poll the store until the instance reaches a terminal status.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.store.read(instance).await {
                Ok(records) => {
                    let status = status_of(&records);
                    if status.is_terminal() {
                        return Ok(status);
                    }
                }
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(WaitError::Store(e)),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(self.options.poll_interval_ms)).await;
        }
    }

    /// Abort all background tasks. History already committed is unaffected.
    pub async fn shutdown(&self) {
        for handle in self.joins.lock().await.drain(..) {
            handle.abort();
        }
    }

    /// Spawn the execution loop for an instance, refusing double activation
    /// so only one replay drives an instance at a time.
    async fn activate(self: &Arc<Self>, instance: String) {
        {
            let mut active = self.active.lock().await;
            if !active.insert(instance.clone()) {
                debug!(instance = %instance, "instance already active");
                return;
            }
        }
        let rx = self.router.register(&instance).await;
        let rt = self.clone();
        let handle = tokio::spawn(async move {
            rt.run_instance(&instance, rx).await;
            rt.router.unregister(&instance).await;
            rt.active.lock().await.remove(&instance);
        });
        self.joins.lock().await.push(handle);
    }

    fn dispatch(&self, instance: &str, seq: u64, name: &str, input: &str, attempt: u32, cancel: watch::Receiver<bool>) {
        debug!(instance, seq, activity = %name, attempt, "dispatching activity");
        let item = ActivityWorkItem {
            instance: instance.to_string(),
            seq,
            name: name.to_string(),
            input: input.to_string(),
            attempt,
            timeout_ms: self.options.activity_timeout_ms,
            cancel,
        };
        if self.work_tx.send(item).is_err() {
            error!(instance, seq, "work queue closed, dropping dispatch");
        }
    }

    fn dispatch_after(&self, delay: Duration, item: ActivityWorkItem) {
        let tx = self.work_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(item);
        });
    }

    /// Execution loop for one instance. Sole history writer for its lifetime;
    /// an append conflict therefore means an external writer and forces a
    /// re-read instead of a blind retry.
    async fn run_instance(self: &Arc<Self>, instance: &str, mut rx: mpsc::UnboundedReceiver<OrchestratorMsg>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        // Attempt counts reset on restart; the history-backed guarantee is
        // at-least-once execution, not a durable attempt ledger.
        let mut attempts: HashMap<u64, u32> = HashMap::new();
        let mut in_flight: HashSet<u64> = HashSet::new();

        'drive: loop {
            let records = match self.store.read(instance).await {
                Ok(r) => r,
                Err(e) => {
                    error!(instance, error = %e, "cannot read history, abandoning instance");
                    return;
                }
            };
            if status_of(&records).is_terminal() {
                return;
            }
            let mut committed = records.len();
            let events = providers::events(&records);

            let Some((name, input)) = events.iter().find_map(|e| match e {
                Event::OrchestratorStarted { name, input } => Some((name.clone(), input.clone())),
                _ => None,
            }) else {
                warn!(instance, "no start event recorded, leaving instance pending");
                return;
            };

            let Some(handler) = self.orchestrations.get(&name) else {
                let error = ActivityError::new(
                    ErrorKind::UnknownOrchestration,
                    format!("no handler registered for orchestration '{name}'"),
                );
                self.commit_terminal(instance, committed, Event::OrchestratorFailed { error })
                    .await;
                return;
            };

            let turn = run_turn(events, |ctx| {
                let handler = handler.clone();
                let input = input.clone();
                async move { handler.invoke(ctx, input).await }
            });

            if let Some(reason) = turn.nondeterminism {
                error!(instance, %reason, "nondeterministic orchestration");
                let error = ActivityError::new(ErrorKind::NonDeterminism, reason);
                match self
                    .store
                    .append(instance, committed, vec![Event::OrchestratorFailed { error }])
                    .await
                {
                    Ok(()) | Err(StoreError::ConcurrencyConflict { .. }) => {}
                    Err(e) => error!(instance, error = %e, "failed to commit nondeterminism failure"),
                }
                return;
            }

            if let Some(output) = turn.output {
                let terminal = match output {
                    Ok(result) => Event::OrchestratorCompleted { result },
                    Err(error) => Event::OrchestratorFailed { error },
                };
                match self.store.append(instance, committed, vec![terminal]).await {
                    Ok(()) => {
                        debug!(instance, "orchestration reached terminal state");
                        return;
                    }
                    Err(StoreError::ConcurrencyConflict { .. }) => continue 'drive,
                    Err(e) => {
                        error!(instance, error = %e, "failed to commit terminal event");
                        return;
                    }
                }
            }

            let history = turn.history;
            let delta: Vec<Event> = history[committed..].to_vec();
            if !delta.is_empty() {
                match self.store.append(instance, committed, delta.clone()).await {
                    Ok(()) => committed += delta.len(),
                    Err(StoreError::ConcurrencyConflict { .. }) => continue 'drive,
                    Err(e) => {
                        error!(instance, error = %e, "failed to commit scheduling decisions");
                        return;
                    }
                }
            }

            // Dispatch every scheduled-but-unresolved task not already in
            // flight. After a restart this is what re-issues the frontier
            // task exactly once.
            for (seq, task_name, task_input) in pending_tasks(&history) {
                if in_flight.contains(&seq) {
                    continue;
                }
                let attempt = *attempts.entry(seq).or_insert(1);
                self.dispatch(instance, seq, &task_name, &task_input, attempt, cancel_rx.clone());
                in_flight.insert(seq);
            }

            // Suspend until a completion or termination arrives.
            loop {
                let msg = match rx.recv().await {
                    Some(msg) => msg,
                    None => return, // runtime shut down
                };
                match msg {
                    OrchestratorMsg::TaskCompleted { seq, result, .. } => {
                        in_flight.remove(&seq);
                        match self
                            .store
                            .append(instance, committed, vec![Event::TaskCompleted { seq, result }])
                            .await
                        {
                            // On conflict the result is dropped and the task
                            // redispatched after re-read: at-least-once.
                            Ok(()) | Err(StoreError::ConcurrencyConflict { .. }) => {}
                            Err(e) => {
                                error!(instance, seq, error = %e, "failed to commit task completion");
                                return;
                            }
                        }
                        continue 'drive;
                    }
                    OrchestratorMsg::TaskFailed { seq, error, .. } => {
                        let attempt = attempts.get(&seq).copied().unwrap_or(1);
                        if error.is_transient() && attempt < self.options.max_attempts {
                            attempts.insert(seq, attempt + 1);
                            warn!(instance, seq, attempt, error = %error, "transient failure, redispatching");
                            if let Some((task_name, task_input)) = scheduled_task(&history, seq) {
                                let item = ActivityWorkItem {
                                    instance: instance.to_string(),
                                    seq,
                                    name: task_name,
                                    input: task_input,
                                    attempt: attempt + 1,
                                    timeout_ms: self.options.activity_timeout_ms,
                                    cancel: cancel_rx.clone(),
                                };
                                let backoff =
                                    Duration::from_millis(self.options.retry_backoff_ms * attempt as u64);
                                self.dispatch_after(backoff, item);
                                // Task stays in flight; keep waiting.
                                continue;
                            }
                            error!(instance, seq, "no scheduling record for failed task");
                        }
                        in_flight.remove(&seq);
                        match self
                            .store
                            .append(instance, committed, vec![Event::TaskFailed { seq, error }])
                            .await
                        {
                            Ok(()) | Err(StoreError::ConcurrencyConflict { .. }) => {}
                            Err(e) => {
                                error!(instance, seq, error = %e, "failed to commit task failure");
                                return;
                            }
                        }
                        continue 'drive;
                    }
                    OrchestratorMsg::Terminate { reason, .. } => {
                        warn!(instance, %reason, "terminating instance");
                        let _ = cancel_tx.send(true);
                        self.commit_terminal(instance, committed, Event::OrchestratorTerminated { reason })
                            .await;
                        return;
                    }
                }
            }
        }
    }

    async fn commit_terminal(&self, instance: &str, committed: usize, event: Event) {
        match self.store.append(instance, committed, vec![event]).await {
            Ok(()) => {}
            Err(e) => error!(instance, error = %e, "failed to commit terminal event"),
        }
    }
}

/// Scheduled tasks with no recorded outcome yet.
fn pending_tasks(history: &[Event]) -> Vec<(u64, String, String)> {
    let resolved: HashSet<u64> = history
        .iter()
        .filter_map(|e| match e {
            Event::TaskCompleted { seq, .. } | Event::TaskFailed { seq, .. } => Some(*seq),
            _ => None,
        })
        .collect();
    history
        .iter()
        .filter_map(|e| match e {
            Event::TaskScheduled { seq, name, input } if !resolved.contains(seq) => {
                Some((*seq, name.clone(), input.clone()))
            }
            _ => None,
        })
        .collect()
}

fn scheduled_task(history: &[Event], seq: u64) -> Option<(String, String)> {
    history.iter().find_map(|e| match e {
        Event::TaskScheduled { seq: s, name, input } if *s == seq => Some((name.clone(), input.clone())),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_derivation_from_history() {
        assert_eq!(status_of(&[]), OrchestrationStatus::Pending);

        let started = HistoryRecord {
            ts_ms: 1,
            event: Event::OrchestratorStarted { name: "O".into(), input: "x".into() },
        };
        assert_eq!(status_of(std::slice::from_ref(&started)), OrchestrationStatus::Running);

        let completed = HistoryRecord {
            ts_ms: 2,
            event: Event::OrchestratorCompleted { result: "out".into() },
        };
        assert_eq!(
            status_of(&[started.clone(), completed]),
            OrchestrationStatus::Completed { output: "out".into() }
        );

        let terminated = HistoryRecord {
            ts_ms: 2,
            event: Event::OrchestratorTerminated { reason: "bye".into() },
        };
        assert_eq!(
            status_of(&[started, terminated]),
            OrchestrationStatus::Terminated { reason: "bye".into() }
        );
    }

    #[test]
    fn pending_tasks_skips_resolved_seqs() {
        let history = vec![
            Event::TaskScheduled { seq: 0, name: "A".into(), input: "a".into() },
            Event::TaskCompleted { seq: 0, result: "ok".into() },
            Event::TaskScheduled { seq: 1, name: "B".into(), input: "b".into() },
        ];
        let pending = pending_tasks(&history);
        assert_eq!(pending, vec![(1, "B".to_string(), "b".to_string())]);
    }
}
