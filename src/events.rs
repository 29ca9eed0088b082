//! Lifecycle events emitted by queues and workers

use tokio::sync::broadcast;
use tracing::debug;

/// Exit status a worker daemon resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Clean stop (restart requested, stop flag, queue drained in once-mode)
    Success,
    /// Stopped after an unrecoverable error
    Error,
    /// Memory ceiling exceeded
    MemoryExceeded,
}

impl ExitStatus {
    /// Conventional process exit code for this status.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Error => 1,
            ExitStatus::MemoryExceeded => 12,
        }
    }
}

/// Events observers can subscribe to.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A job is about to be handed to its handler
    Processing {
        connection: String,
        queue: String,
        job: String,
        id: String,
    },
    /// The handler completed without error
    Processed {
        connection: String,
        queue: String,
        job: String,
        id: String,
    },
    /// The handler (or the worker around it) raised an error; the job may
    /// still be retried
    ExceptionOccurred {
        connection: String,
        queue: String,
        job: String,
        id: String,
        error: String,
    },
    /// The job was terminally failed and recorded in the ledger
    Failed {
        connection: String,
        queue: String,
        job: String,
        id: String,
        error: String,
    },
    /// The worker finished one pass of its loop
    Looping { connection: String, queue: String },
    /// The worker is about to stop
    WorkerStopping { status: ExitStatus },
}

/// Broadcast fan-out for [`QueueEvent`]s.
///
/// Emitting with no subscribers is fine; events are observability, never
/// control flow.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: QueueEvent) {
        debug!(event = ?event, "queue event");
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(QueueEvent::Looping {
            connection: "database".into(),
            queue: "default".into(),
        });

        match rx.recv().await.unwrap() {
            QueueEvent::Looping { connection, queue } => {
                assert_eq!(connection, "database");
                assert_eq!(queue, "default");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(QueueEvent::WorkerStopping {
            status: ExitStatus::Success,
        });
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(ExitStatus::Error.code(), 1);
        assert_eq!(ExitStatus::MemoryExceeded.code(), 12);
    }
}
