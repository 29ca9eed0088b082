//! Backend that discards everything

use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::{Envelope, JobData};
use crate::error::QueueResult;
use crate::handler::HandlerResolver;
use crate::job::ReservedJob;
use crate::queue::Queue;
use crate::time::Delay;

/// Accepts every push and drops it. Useful for disabling queueing in
/// environments where enqueued work should silently vanish.
pub struct NullQueue {
    connection: String,
    resolver: Arc<dyn HandlerResolver>,
}

impl NullQueue {
    pub fn new(connection: impl Into<String>, resolver: Arc<dyn HandlerResolver>) -> Self {
        Self {
            connection: connection.into(),
            resolver,
        }
    }
}

#[async_trait]
impl Queue for NullQueue {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    async fn size(&self, _queue: Option<&str>) -> QueueResult<u64> {
        Ok(0)
    }

    async fn push(&self, job: &str, data: JobData, _queue: Option<&str>) -> QueueResult<String> {
        // Still validates the handler name so producer bugs surface.
        let envelope = Envelope::new(self.resolver.as_ref(), job, data)?;
        Ok(envelope.id)
    }

    async fn push_raw(&self, payload: &str, _queue: Option<&str>) -> QueueResult<String> {
        let envelope = Envelope::decode(payload)?;
        Ok(envelope.id)
    }

    async fn later(
        &self,
        _delay: Delay,
        job: &str,
        data: JobData,
        queue: Option<&str>,
    ) -> QueueResult<String> {
        self.push(job, data, queue).await
    }

    async fn pop(&self, _queue: Option<&str>) -> QueueResult<Option<Box<dyn ReservedJob>>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::error::QueueError;
    use crate::handler::{HandlerRegistry, JobHandler};

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn fire(&self, _job: &dyn ReservedJob, _data: &JobData) -> QueueResult<()> {
            Ok(())
        }
    }

    fn queue() -> NullQueue {
        let registry = HandlerRegistry::new();
        registry.register("noop", Arc::new(Noop));
        NullQueue::new("null", Arc::new(registry))
    }

    #[tokio::test]
    async fn discards_but_returns_an_id() {
        let q = queue();
        let id = q.push("noop", json!({}), None).await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(q.size(None).await.unwrap(), 0);
        assert!(q.pop(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn still_rejects_unknown_handlers() {
        let err = queue().push("ghost", json!({}), None).await.unwrap_err();
        assert!(matches!(err, QueueError::HandlerNotFound(_)));
    }
}
