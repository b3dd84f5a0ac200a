use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::ActivityError;

/// Messages delivered to an instance's execution loop by workers and clients.
#[derive(Debug)]
pub enum OrchestratorMsg {
    TaskCompleted {
        instance: String,
        seq: u64,
        result: String,
    },
    TaskFailed {
        instance: String,
        seq: u64,
        error: ActivityError,
    },
    Terminate {
        instance: String,
        reason: String,
    },
}

pub fn kind_of(msg: &OrchestratorMsg) -> &'static str {
    match msg {
        OrchestratorMsg::TaskCompleted { .. } => "TaskCompleted",
        OrchestratorMsg::TaskFailed { .. } => "TaskFailed",
        OrchestratorMsg::Terminate { .. } => "Terminate",
    }
}

/// Per-instance inboxes. Messages for unknown instances (terminated or never
/// activated) are dropped with a warning; redelivery comes from redispatch,
/// not the router.
#[derive(Default)]
pub struct InstanceRouter {
    inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>>,
}

impl InstanceRouter {
    pub async fn register(&self, instance: &str) -> mpsc::UnboundedReceiver<OrchestratorMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(instance.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, instance: &str) {
        self.inboxes.lock().await.remove(instance);
    }

    pub async fn forward(&self, msg: OrchestratorMsg) {
        let key = match &msg {
            OrchestratorMsg::TaskCompleted { instance, .. }
            | OrchestratorMsg::TaskFailed { instance, .. }
            | OrchestratorMsg::Terminate { instance, .. } => instance.clone(),
        };
        let kind = kind_of(&msg);
        let mut map = self.inboxes.lock().await;
        match map.get(&key) {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    map.remove(&key);
                    warn!(instance = %key, kind, "router: receiver dropped, removing inbox");
                }
            }
            None => {
                warn!(instance = %key, kind, "router: unknown instance, dropping message");
            }
        }
    }
}
