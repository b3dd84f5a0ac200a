use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::registry::{ActivityContext, ActivityRegistry};
use super::router::OrchestratorMsg;
use crate::ActivityError;

/// A dispatched unit of activity work. Created by the engine for every
/// scheduling decision with no recorded outcome; redispatches carry the same
/// seq with an incremented attempt.
#[derive(Debug, Clone)]
pub struct ActivityWorkItem {
    pub instance: String,
    pub seq: u64,
    pub name: String,
    pub input: String,
    pub attempt: u32,
    pub timeout_ms: Option<u64>,
    pub cancel: watch::Receiver<bool>,
}

/// Executes registered handlers for incoming work items, one spawned task per
/// item, and reports structured outcomes on the completion channel. Stateless
/// per call; retry decisions belong to the engine.
pub struct ActivityWorker {
    registry: Arc<ActivityRegistry>,
    completion_tx: mpsc::UnboundedSender<OrchestratorMsg>,
}

impl ActivityWorker {
    pub fn new(registry: Arc<ActivityRegistry>, completion_tx: mpsc::UnboundedSender<OrchestratorMsg>) -> Self {
        Self {
            registry,
            completion_tx,
        }
    }

    /// Consume work items until the channel closes.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<ActivityWorkItem>) {
        while let Some(item) = rx.recv().await {
            let registry = self.registry.clone();
            let tx = self.completion_tx.clone();
            tokio::spawn(async move {
                let msg = execute(&registry, item).await;
                if tx.send(msg).is_err() {
                    warn!("activity worker: completion channel closed, dropping result");
                }
            });
        }
    }
}

/// Run one work item to a structured outcome. Handler failures and timeouts
/// become `TaskFailed` messages, never a crash of the worker.
async fn execute(registry: &ActivityRegistry, item: ActivityWorkItem) -> OrchestratorMsg {
    let Some(handler) = registry.get(&item.name) else {
        return OrchestratorMsg::TaskFailed {
            instance: item.instance,
            seq: item.seq,
            error: ActivityError::unknown_activity(&item.name),
        };
    };

    debug!(
        instance = %item.instance,
        seq = item.seq,
        activity = %item.name,
        attempt = item.attempt,
        "executing activity"
    );

    let ctx = ActivityContext::new(item.instance.clone(), item.seq, item.attempt, item.cancel.clone());
    let invocation = handler.invoke(ctx, item.input);
    let outcome = match item.timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), invocation).await {
            Ok(res) => res,
            // Dropping the invocation future cancels it; cooperative handlers
            // also observe the cancel signal for any detached work.
            Err(_elapsed) => Err(ActivityError::timeout(format!(
                "activity '{}' did not return within {ms}ms",
                item.name
            ))),
        },
        None => invocation.await,
    };

    match outcome {
        Ok(result) => OrchestratorMsg::TaskCompleted {
            instance: item.instance,
            seq: item.seq,
            result,
        },
        Err(error) => {
            warn!(
                instance = %item.instance,
                seq = item.seq,
                activity = %item.name,
                attempt = item.attempt,
                error = %error,
                "activity failed"
            );
            OrchestratorMsg::TaskFailed {
                instance: item.instance,
                seq: item.seq,
                error,
            }
        }
    }
}
