use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use serde::{Deserialize, Serialize};

pub mod client;
pub mod pipeline;
pub mod providers;
pub mod runtime;

/// Classification of failures recorded in history and surfaced to callers.
///
/// `Timeout` and `Transient` are retried by the engine up to its attempt
/// limit; everything else commits immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    UnknownOrchestration,
    UnknownActivity,
    InvalidImageEncoding,
    Timeout,
    Transient,
    Permanent,
    NonDeterminism,
}

/// Structured failure value. Recorded in `TaskFailed` / `OrchestratorFailed`
/// events and surfaced into orchestration code as a catchable error at the
/// scheduling call that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ActivityError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ActivityError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn invalid_encoding(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidImageEncoding, message)
    }

    pub fn unknown_activity(name: &str) -> Self {
        Self::new(
            ErrorKind::UnknownActivity,
            format!("no handler registered for activity '{name}'"),
        )
    }

    /// Whether the engine may redispatch the task instead of committing the failure.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout | ErrorKind::Transient)
    }
}

/// Append-only history event for one orchestration instance.
///
/// `seq` numbers scheduling decisions in the order the orchestration code
/// issues them, starting at 0 and gap-free. Once a `TaskCompleted` or
/// `TaskFailed` exists for a seq, replays reuse it and never re-execute that
/// task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OrchestratorStarted { name: String, input: String },
    TaskScheduled { seq: u64, name: String, input: String },
    TaskCompleted { seq: u64, result: String },
    TaskFailed { seq: u64, error: ActivityError },
    OrchestratorCompleted { result: String },
    OrchestratorFailed { error: ActivityError },
    OrchestratorTerminated { reason: String },
}

/// Dispatch decision produced by a replay turn for the host to materialize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ScheduleTask { seq: u64, name: String, input: String },
}

#[derive(Debug)]
struct CtxInner {
    history: Vec<Event>,
    next_seq: u64,
    actions: Vec<Action>,
    nondeterminism: Option<String>,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        Self {
            history,
            next_seq: 0,
            actions: Vec::new(),
            nondeterminism: None,
        }
    }

    fn scheduled_at(&self, seq: u64) -> Option<(String, String)> {
        self.history.iter().find_map(|e| match e {
            Event::TaskScheduled { seq: s, name, input } if *s == seq => Some((name.clone(), input.clone())),
            _ => None,
        })
    }

    fn completion_at(&self, seq: u64) -> Option<Result<String, ActivityError>> {
        self.history.iter().find_map(|e| match e {
            Event::TaskCompleted { seq: s, result } if *s == seq => Some(Ok(result.clone())),
            Event::TaskFailed { seq: s, error } if *s == seq => Some(Err(error.clone())),
            _ => None,
        })
    }

    /// True if history records scheduling decisions the current pass never claimed.
    fn has_unclaimed_schedules(&self) -> bool {
        self.history
            .iter()
            .any(|e| matches!(e, Event::TaskScheduled { seq, .. } if *seq >= self.next_seq))
    }

    fn record_action(&mut self, a: Action) {
        self.actions.push(a);
    }
}

/// Deterministic scheduling surface handed to orchestration code.
///
/// Every replay pass constructs a fresh context over the full recorded
/// history; scheduling calls either consume recorded results or append new
/// `TaskScheduled` decisions at the replay frontier.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub fn new(history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    /// Schedule a named activity. The returned future resolves with the
    /// recorded result during replay, or suspends the pass at the frontier.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> ActivityFuture {
        ActivityFuture {
            name: name.into(),
            input: input.into(),
            claimed_seq: Cell::new(None),
            ctx: self.clone(),
        }
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().unwrap().actions)
    }

    fn take_history(&self) -> Vec<Event> {
        std::mem::take(&mut self.inner.lock().unwrap().history)
    }
}

/// Future returned by [`OrchestrationContext::schedule_activity`].
pub struct ActivityFuture {
    name: String,
    input: String,
    claimed_seq: Cell<Option<u64>>,
    ctx: OrchestrationContext,
}

impl Future for ActivityFuture {
    type Output = Result<String, ActivityError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.inner.lock().unwrap();

        // A diverged pass is poisoned; nothing past the divergence runs.
        if inner.nondeterminism.is_some() {
            return Poll::Pending;
        }

        let seq = match this.claimed_seq.get() {
            Some(seq) => seq,
            None => {
                // Claim the next sequence position, in poll order.
                let seq = inner.next_seq;
                inner.next_seq += 1;
                match inner.scheduled_at(seq) {
                    Some((recorded_name, recorded_input)) => {
                        if recorded_name != this.name || recorded_input != this.input {
                            inner.nondeterminism = Some(format!(
                                "schedule mismatch at seq {seq}: history recorded '{recorded_name}' but code scheduled '{}'",
                                this.name
                            ));
                            return Poll::Pending;
                        }
                    }
                    None => {
                        // Replay frontier: record the decision and let the host dispatch it.
                        inner.history.push(Event::TaskScheduled {
                            seq,
                            name: this.name.clone(),
                            input: this.input.clone(),
                        });
                        inner.record_action(Action::ScheduleTask {
                            seq,
                            name: this.name.clone(),
                            input: this.input.clone(),
                        });
                    }
                }
                this.claimed_seq.set(Some(seq));
                seq
            }
        };

        match inner.completion_at(seq) {
            Some(Ok(result)) => Poll::Ready(Ok(result)),
            Some(Err(error)) => Poll::Ready(Err(error)),
            None => Poll::Pending,
        }
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future>(fut: &mut F) -> Poll<F::Output> {
    let w = noop_waker();
    let mut cx = Context::from_waker(&w);
    // Safety: fut is never moved after this call; we poll in place only.
    let mut pinned = unsafe { Pin::new_unchecked(fut) };
    pinned.as_mut().poll(&mut cx)
}

/// Result of one replay pass over an orchestration definition.
#[derive(Debug)]
pub struct TurnResult {
    /// Input history plus any `TaskScheduled` events appended at the frontier.
    pub history: Vec<Event>,
    /// New dispatch decisions; empty when replaying a fully decided prefix.
    pub actions: Vec<Action>,
    /// Terminal output, once the definition ran to completion.
    pub output: Option<Result<String, ActivityError>>,
    /// Set when the definition diverged from recorded history.
    pub nondeterminism: Option<String>,
}

/// Replay one turn: re-execute the orchestration from the start against the
/// recorded history, short-circuiting decided steps and suspending the whole
/// pass at the first scheduling call with no recorded outcome.
pub fn run_turn<F, Fut>(history: Vec<Event>, orchestrator: F) -> TurnResult
where
    F: Fn(OrchestrationContext) -> Fut,
    Fut: Future<Output = Result<String, ActivityError>>,
{
    let ctx = OrchestrationContext::new(history);
    let mut fut = orchestrator(ctx.clone());
    match poll_once(&mut fut) {
        Poll::Ready(output) => {
            let nondeterminism = {
                let inner = ctx.inner.lock().unwrap();
                if inner.has_unclaimed_schedules() {
                    Some(format!(
                        "history records more scheduling decisions than the definition produced (claimed {})",
                        inner.next_seq
                    ))
                } else {
                    None
                }
            };
            let output = if nondeterminism.is_some() { None } else { Some(output) };
            TurnResult {
                history: ctx.take_history(),
                actions: Vec::new(),
                output,
                nondeterminism,
            }
        }
        Poll::Pending => {
            let nondeterminism = ctx.inner.lock().unwrap().nondeterminism.clone();
            TurnResult {
                history: ctx.take_history(),
                actions: if nondeterminism.is_some() { Vec::new() } else { ctx.take_actions() },
                output: None,
                nondeterminism,
            }
        }
    }
}
