//! The serialized job envelope shared by every backend

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueResult;
use crate::handler::HandlerResolver;

/// Arbitrary JSON payload carried by a job
pub type JobData = serde_json::Value;

/// The unit that travels through a queue backend.
///
/// Everything a worker needs to process the job without extra lookups is in
/// here: the handler name, its data, and the limits the handler declared when
/// the job was enqueued. Only `attempts` is ever rewritten after creation
/// (backends that store the counter in the payload bump it on reservation).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Unique job id, assigned at enqueue time
    pub id: String,
    /// Registered handler name
    pub job: String,
    /// Handler input
    pub data: JobData,
    /// Attempt limit captured from the handler, `None` for unbounded
    #[serde(default)]
    pub max_tries: Option<u32>,
    /// Execution timeout in seconds captured from the handler
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Delivery counter, meaningful only on backends that keep it here
    #[serde(default)]
    pub attempts: u32,
}

impl Envelope {
    /// Build an envelope for `job`, resolving the handler to capture its
    /// declared limits. Fails with [`QueueError::HandlerNotFound`] when no
    /// handler is registered, so bad names are caught at enqueue time.
    ///
    /// [`QueueError::HandlerNotFound`]: crate::QueueError::HandlerNotFound
    pub fn new(resolver: &dyn HandlerResolver, job: &str, data: JobData) -> QueueResult<Self> {
        let handler = resolver.resolve(job)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            job: job.to_string(),
            data,
            max_tries: handler.max_tries(),
            timeout: handler.timeout(),
            attempts: 0,
        })
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> QueueResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an envelope off the wire.
    pub fn decode(payload: &str) -> QueueResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::error::{QueueError, QueueResult};
    use crate::handler::{HandlerRegistry, JobHandler};
    use crate::job::ReservedJob;

    struct Limited;

    #[async_trait]
    impl JobHandler for Limited {
        async fn fire(&self, _job: &dyn ReservedJob, _data: &JobData) -> QueueResult<()> {
            Ok(())
        }

        fn max_tries(&self) -> Option<u32> {
            Some(3)
        }

        fn timeout(&self) -> Option<u64> {
            Some(30)
        }
    }

    fn registry() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        registry.register("limited", Arc::new(Limited));
        registry
    }

    #[test]
    fn captures_handler_limits() {
        let envelope = Envelope::new(&registry(), "limited", json!({"n": 1})).unwrap();
        assert_eq!(envelope.job, "limited");
        assert_eq!(envelope.max_tries, Some(3));
        assert_eq!(envelope.timeout, Some(30));
        assert_eq!(envelope.attempts, 0);
        assert!(!envelope.id.is_empty());
    }

    #[test]
    fn unknown_job_fails_at_enqueue_time() {
        let err = Envelope::new(&registry(), "missing", json!({})).unwrap_err();
        assert!(matches!(err, QueueError::HandlerNotFound(_)));
    }

    #[test]
    fn round_trips_through_the_wire_format() {
        let envelope = Envelope::new(&registry(), "limited", json!({"to": "a@b.c"})).unwrap();
        let encoded = envelope.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn missing_optional_fields_default() {
        let decoded =
            Envelope::decode(r#"{"id":"1","job":"limited","data":null}"#).unwrap();
        assert_eq!(decoded.max_tries, None);
        assert_eq!(decoded.timeout, None);
        assert_eq!(decoded.attempts, 0);
    }

    #[test]
    fn garbage_is_a_payload_error() {
        let err = Envelope::decode("not json").unwrap_err();
        assert!(matches!(err, QueueError::Payload(_)));
    }
}
