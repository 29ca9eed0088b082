//! Job handler traits and the name-based registry

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::envelope::JobData;
use crate::error::{QueueError, QueueResult};
use crate::job::ReservedJob;

/// Application code that executes a job.
///
/// Handlers are registered under a stable name which producers reference when
/// enqueueing. A handler may declare per-job retry and timeout limits; these
/// are baked into the envelope at enqueue time so the worker that eventually
/// processes the job does not need the handler resolved to enforce them.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job.
    async fn fire(&self, job: &dyn ReservedJob, data: &JobData) -> QueueResult<()>;

    /// Called once when the job is terminally failed. Default is a no-op.
    async fn failed(&self, _error: &QueueError, _data: &JobData) {}

    /// Maximum attempts for jobs handled here. `None` means unbounded.
    fn max_tries(&self) -> Option<u32> {
        None
    }

    /// Per-job execution timeout in seconds. `None` defers to the worker.
    fn timeout(&self) -> Option<u64> {
        None
    }
}

impl std::fmt::Debug for dyn JobHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandler")
            .field("max_tries", &self.max_tries())
            .field("timeout", &self.timeout())
            .finish()
    }
}

/// Resolves a handler name to its implementation.
pub trait HandlerResolver: Send + Sync {
    /// Look up the handler registered under `name`.
    fn resolve(&self, name: &str) -> QueueResult<Arc<dyn JobHandler>>;
}

/// Map-backed [`HandlerResolver`].
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`, replacing any previous registration.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.write().insert(name.into(), handler);
    }

    /// Whether a handler is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, name: &str) -> QueueResult<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::HandlerNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn fire(&self, _job: &dyn ReservedJob, _data: &JobData) -> QueueResult<()> {
            Ok(())
        }

        fn max_tries(&self) -> Option<u32> {
            Some(5)
        }
    }

    #[test]
    fn resolves_registered_handler() {
        let registry = HandlerRegistry::new();
        registry.register("noop", Arc::new(Noop));

        assert!(registry.contains("noop"));
        let handler = registry.resolve("noop").unwrap();
        assert_eq!(handler.max_tries(), Some(5));
        assert_eq!(handler.timeout(), None);
    }

    #[test]
    fn missing_handler_is_an_error() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve("ghost").unwrap_err();
        assert!(matches!(err, QueueError::HandlerNotFound(name) if name == "ghost"));
    }
}
