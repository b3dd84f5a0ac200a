//! Thin client facade over the runtime for starting, querying, waiting on,
//! and terminating orchestration instances.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::providers::StoreError;
use crate::runtime::{OrchestrationStatus, Runtime, StartError, StatusReport, WaitError};

/// Handle for external callers. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    runtime: Arc<Runtime>,
}

impl Client {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// Start an orchestration under a fresh instance id and return the id.
    pub async fn start(&self, orchestration: &str, input: impl Into<String>) -> Result<String, StartError> {
        let instance = Uuid::new_v4().to_string();
        self.runtime
            .start_orchestration(&instance, orchestration, input)
            .await?;
        Ok(instance)
    }

    /// Start an orchestration under a caller-chosen instance id.
    /// Fails with `Store(AlreadyExists)` if the id is taken.
    pub async fn start_with_id(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), StartError> {
        self.runtime.start_orchestration(instance, orchestration, input).await
    }

    pub async fn status(&self, instance: &str) -> OrchestrationStatus {
        self.runtime.get_orchestration_status(instance).await
    }

    pub async fn status_report(&self, instance: &str) -> Result<StatusReport, StoreError> {
        self.runtime.get_status_report(instance).await
    }

    /// Block until the instance reaches a terminal status or the timeout
    /// elapses.
    pub async fn wait(&self, instance: &str, timeout: Duration) -> Result<OrchestrationStatus, WaitError> {
        self.runtime.wait_for_orchestration(instance, timeout).await
    }

    /// Request best-effort termination of a running instance.
    pub async fn terminate(&self, instance: &str, reason: impl Into<String>) {
        self.runtime.terminate(instance, reason).await;
    }
}
