use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{ActivityError, OrchestrationContext};

/// Execution-scoped context handed to activity handlers.
#[derive(Clone)]
pub struct ActivityContext {
    pub instance: String,
    pub seq: u64,
    pub attempt: u32,
    cancel: watch::Receiver<bool>,
}

impl ActivityContext {
    pub(crate) fn new(instance: String, seq: u64, attempt: u32, cancel: watch::Receiver<bool>) -> Self {
        Self {
            instance,
            seq,
            attempt,
            cancel,
        }
    }

    /// Best-effort cooperative cancellation check; handlers should poll this
    /// in long-running loops.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves when the instance is cancelled. Never resolves spuriously;
    /// if the runtime goes away the signal stays quiet forever.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Trait implemented by activity handlers invoked by the worker pool.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityError>;
}

/// Function wrapper that implements `ActivityHandler`.
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityError> {
        (self.0)(ctx, input).await
    }
}

/// Immutable registry mapping activity names to handlers. Built once at
/// startup, read-only thereafter.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    inner: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder { map: HashMap::new() }
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

/// Builder for `ActivityRegistry`. Duplicate names replace earlier entries,
/// last registration wins.
pub struct ActivityRegistryBuilder {
    map: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
    {
        self.map.insert(name.into(), Arc::new(FnActivity(f)));
        self
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }
}

/// Trait implemented by orchestration handlers driven by replay.
///
/// Implementations must be deterministic: given the same sequence of recorded
/// results they must schedule the same activities with the same inputs.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, ActivityError>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, ActivityError> {
        (self.0)(ctx, input).await
    }
}

/// Immutable registry mapping orchestration names to handlers.
#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    inner: Arc<HashMap<String, Arc<dyn OrchestrationHandler>>>,
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        OrchestrationRegistryBuilder { map: HashMap::new() }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OrchestrationHandler>> {
        self.inner.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

/// Builder for `OrchestrationRegistry`.
pub struct OrchestrationRegistryBuilder {
    map: HashMap<String, Arc<dyn OrchestrationHandler>>,
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
    {
        self.map.insert(name.into(), Arc::new(FnOrchestration(f)));
        self
    }

    pub fn build(self) -> OrchestrationRegistry {
        OrchestrationRegistry {
            inner: Arc::new(self.map),
        }
    }
}
