//! The common backend contract

use async_trait::async_trait;

use crate::envelope::JobData;
use crate::error::QueueResult;
use crate::job::ReservedJob;
use crate::time::Delay;

/// A queue backend.
///
/// Object-safe so the registry can hand out `Arc<dyn Queue>` regardless of
/// driver. `queue: None` means the connection's configured default queue.
#[async_trait]
pub trait Queue: Send + Sync {
    /// The connection name this instance was resolved under.
    fn connection_name(&self) -> &str;

    /// Approximate number of pending jobs. Delayed and reserved jobs count
    /// where the backend can see them.
    async fn size(&self, queue: Option<&str>) -> QueueResult<u64>;

    /// Enqueue a job for immediate availability. Returns the job id.
    async fn push(&self, job: &str, data: JobData, queue: Option<&str>) -> QueueResult<String>;

    /// Enqueue an already-serialized payload.
    async fn push_raw(&self, payload: &str, queue: Option<&str>) -> QueueResult<String>;

    /// Enqueue a job that becomes available after `delay`.
    async fn later(
        &self,
        delay: Delay,
        job: &str,
        data: JobData,
        queue: Option<&str>,
    ) -> QueueResult<String>;

    /// Enqueue several jobs sharing the same data. No atomicity across
    /// items; the default is a per-item loop.
    async fn bulk(&self, jobs: &[&str], data: JobData, queue: Option<&str>) -> QueueResult<()> {
        for job in jobs {
            self.push(job, data.clone(), queue).await?;
        }
        Ok(())
    }

    /// Reserve the next available job, if any.
    async fn pop(&self, queue: Option<&str>) -> QueueResult<Option<Box<dyn ReservedJob>>>;
}

impl std::fmt::Debug for dyn Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("connection", &self.connection_name())
            .finish()
    }
}
