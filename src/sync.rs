//! Backend that executes jobs inline at enqueue time

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::error;

use crate::envelope::{Envelope, JobData};
use crate::error::QueueResult;
use crate::events::{EventBus, QueueEvent};
use crate::handler::HandlerResolver;
use crate::job::{JobState, ReservedJob};
use crate::queue::Queue;
use crate::time::Delay;

/// Runs the handler inside `push` and propagates its error to the caller.
///
/// The full worker event sequence still fires, so observers cannot tell a
/// sync-processed job from a daemon-processed one. There is no retry: a
/// failing job is failed terminally on its single attempt.
pub struct SyncQueue {
    connection: String,
    resolver: Arc<dyn HandlerResolver>,
    events: EventBus,
}

impl SyncQueue {
    pub fn new(
        connection: impl Into<String>,
        resolver: Arc<dyn HandlerResolver>,
        events: EventBus,
    ) -> Self {
        Self {
            connection: connection.into(),
            resolver,
            events,
        }
    }

    async fn execute(&self, envelope: Envelope, queue: &str) -> QueueResult<String> {
        let job = SyncJob {
            envelope,
            raw: String::new(),
            connection: self.connection.clone(),
            queue: queue.to_string(),
            state: JobState::new(),
        };
        let handler = self.resolver.resolve(job.name())?;

        self.events.emit(QueueEvent::Processing {
            connection: self.connection.clone(),
            queue: queue.to_string(),
            job: job.name().to_string(),
            id: job.job_id().to_string(),
        });

        match handler.fire(&job, &job.envelope.data).await {
            Ok(()) => {
                self.events.emit(QueueEvent::Processed {
                    connection: self.connection.clone(),
                    queue: queue.to_string(),
                    job: job.name().to_string(),
                    id: job.job_id().to_string(),
                });
                Ok(job.envelope.id)
            }
            Err(e) => {
                error!(job = job.name(), error = %e, "sync job failed");
                self.events.emit(QueueEvent::ExceptionOccurred {
                    connection: self.connection.clone(),
                    queue: queue.to_string(),
                    job: job.name().to_string(),
                    id: job.job_id().to_string(),
                    error: e.to_string(),
                });
                job.mark_failed();
                job.delete().await?;
                handler.failed(&e, &job.envelope.data).await;
                self.events.emit(QueueEvent::Failed {
                    connection: self.connection.clone(),
                    queue: queue.to_string(),
                    job: job.name().to_string(),
                    id: job.job_id().to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Queue for SyncQueue {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    async fn size(&self, _queue: Option<&str>) -> QueueResult<u64> {
        Ok(0)
    }

    async fn push(&self, job: &str, data: JobData, queue: Option<&str>) -> QueueResult<String> {
        let envelope = Envelope::new(self.resolver.as_ref(), job, data)?;
        self.execute(envelope, queue.unwrap_or("default")).await
    }

    async fn push_raw(&self, payload: &str, queue: Option<&str>) -> QueueResult<String> {
        let envelope = Envelope::decode(payload)?;
        self.execute(envelope, queue.unwrap_or("default")).await
    }

    async fn later(
        &self,
        _delay: Delay,
        job: &str,
        data: JobData,
        queue: Option<&str>,
    ) -> QueueResult<String> {
        // Delays are meaningless when execution is inline.
        self.push(job, data, queue).await
    }

    async fn pop(&self, _queue: Option<&str>) -> QueueResult<Option<Box<dyn ReservedJob>>> {
        Ok(None)
    }
}

struct SyncJob {
    envelope: Envelope,
    raw: String,
    connection: String,
    queue: String,
    state: JobState,
}

#[async_trait]
impl ReservedJob for SyncJob {
    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn raw_payload(&self) -> &str {
        &self.raw
    }

    fn connection(&self) -> &str {
        &self.connection
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    fn attempts(&self) -> u32 {
        1
    }

    fn state(&self) -> &JobState {
        &self.state
    }

    async fn delete(&self) -> QueueResult<()> {
        self.state.mark_deleted();
        Ok(())
    }

    async fn release(&self, _delay: Duration) -> QueueResult<()> {
        self.state.mark_released();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::error::QueueError;
    use crate::handler::{HandlerRegistry, JobHandler};

    struct Succeeds;

    #[async_trait]
    impl JobHandler for Succeeds {
        async fn fire(&self, job: &dyn ReservedJob, _data: &JobData) -> QueueResult<()> {
            assert_eq!(job.attempts(), 1);
            Ok(())
        }
    }

    struct Boom {
        failed_calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for Boom {
        async fn fire(&self, _job: &dyn ReservedJob, _data: &JobData) -> QueueResult<()> {
            Err(QueueError::Handler("boom".into()))
        }

        async fn failed(&self, _error: &QueueError, _data: &JobData) {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn make(handler_name: &str, handler: Arc<dyn JobHandler>) -> (SyncQueue, EventBus) {
        let registry = HandlerRegistry::new();
        registry.register(handler_name, handler);
        let events = EventBus::default();
        (
            SyncQueue::new("sync", Arc::new(registry), events.clone()),
            events,
        )
    }

    #[tokio::test]
    async fn success_emits_processing_then_processed() {
        let (queue, events) = make("ok", Arc::new(Succeeds));
        let mut rx = events.subscribe();

        queue.push("ok", json!({}), None).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), QueueEvent::Processing { .. }));
        assert!(matches!(rx.recv().await.unwrap(), QueueEvent::Processed { .. }));
    }

    #[tokio::test]
    async fn failure_surfaces_to_caller_after_full_sequence() {
        let boom = Arc::new(Boom {
            failed_calls: AtomicU32::new(0),
        });
        let (queue, events) = make("boom", boom.clone());
        let mut rx = events.subscribe();

        let err = queue.push("boom", json!({}), None).await.unwrap_err();
        assert!(matches!(err, QueueError::Handler(_)));
        assert_eq!(boom.failed_calls.load(Ordering::SeqCst), 1);

        assert!(matches!(rx.recv().await.unwrap(), QueueEvent::Processing { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            QueueEvent::ExceptionOccurred { .. }
        ));
        assert!(matches!(rx.recv().await.unwrap(), QueueEvent::Failed { .. }));
    }

    #[tokio::test]
    async fn later_runs_immediately() {
        let (queue, _) = make("ok", Arc::new(Succeeds));
        let id = queue
            .later(Delay::For(Duration::from_secs(3600)), "ok", json!({}), None)
            .await
            .unwrap();
        assert!(!id.is_empty());
    }
}
