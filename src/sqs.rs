//! AWS SQS backend
//!
//! SQS keeps the reservation state itself: a received message stays
//! invisible until its visibility timeout lapses, so release is just a
//! visibility change and the delivery counter comes from
//! `ApproximateReceiveCount`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use tracing::{debug, warn};

use crate::config::SqsConfig;
use crate::envelope::{Envelope, JobData};
use crate::error::{QueueError, QueueResult};
use crate::handler::HandlerResolver;
use crate::job::{JobState, ReservedJob};
use crate::queue::Queue;
use crate::time::{self, Delay};

/// Hard SQS limit on per-message delay.
const MAX_DELAY_SECONDS: u64 = 900;

/// Hard SQS limit on a message's visibility timeout (12 hours).
const MAX_VISIBILITY_SECONDS: u64 = 43_200;

fn unavailable(op: &str, err: impl std::fmt::Display) -> QueueError {
    QueueError::Unavailable(format!("sqs {op} failed: {err}"))
}

/// Visibility timeout for a release. The send-time delay cap does not apply
/// here; only the 12-hour visibility ceiling does.
fn visibility_timeout(delay: Duration) -> QueueResult<i32> {
    let secs = delay.as_secs();
    if secs > MAX_VISIBILITY_SECONDS {
        return Err(QueueError::Config(format!(
            "sqs visibility timeouts cap at {MAX_VISIBILITY_SECONDS} seconds, got {secs}"
        )));
    }
    Ok(secs as i32)
}

/// SQS-backed queue.
pub struct SqsQueue {
    connection: String,
    config: SqsConfig,
    client: Client,
    resolver: Arc<dyn HandlerResolver>,
}

impl SqsQueue {
    pub fn new(
        connection: impl Into<String>,
        config: SqsConfig,
        client: Client,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Self {
        Self {
            connection: connection.into(),
            config,
            client,
            resolver,
        }
    }

    /// Full queue URL for `queue`: either already a URL, or prefix + name.
    fn queue_url(&self, queue: Option<&str>) -> String {
        let name = queue.unwrap_or(&self.config.queue);
        if name.starts_with("http://") || name.starts_with("https://") {
            name.to_string()
        } else {
            format!("{}/{}", self.config.prefix.trim_end_matches('/'), name)
        }
    }

    async fn send(&self, url: &str, payload: &str, delay: u64) -> QueueResult<()> {
        if delay > MAX_DELAY_SECONDS {
            return Err(QueueError::Config(format!(
                "sqs delays cap at {MAX_DELAY_SECONDS} seconds, got {delay}"
            )));
        }
        self.client
            .send_message()
            .queue_url(url)
            .message_body(payload)
            .delay_seconds(delay as i32)
            .send()
            .await
            .map_err(|e| unavailable("send_message", e))?;
        Ok(())
    }
}

#[async_trait]
impl Queue for SqsQueue {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    async fn size(&self, queue: Option<&str>) -> QueueResult<u64> {
        let url = self.queue_url(queue);
        let response = self
            .client
            .get_queue_attributes()
            .queue_url(&url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| unavailable("get_queue_attributes", e))?;
        Ok(response
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn push(&self, job: &str, data: JobData, queue: Option<&str>) -> QueueResult<String> {
        let envelope = Envelope::new(self.resolver.as_ref(), job, data)?;
        self.send(&self.queue_url(queue), &envelope.encode()?, 0)
            .await?;
        Ok(envelope.id)
    }

    async fn push_raw(&self, payload: &str, queue: Option<&str>) -> QueueResult<String> {
        let envelope = Envelope::decode(payload)?;
        self.send(&self.queue_url(queue), payload, 0).await?;
        Ok(envelope.id)
    }

    async fn later(
        &self,
        delay: Delay,
        job: &str,
        data: JobData,
        queue: Option<&str>,
    ) -> QueueResult<String> {
        let envelope = Envelope::new(self.resolver.as_ref(), job, data)?;
        self.send(
            &self.queue_url(queue),
            &envelope.encode()?,
            time::seconds_until(delay),
        )
        .await?;
        Ok(envelope.id)
    }

    async fn pop(&self, queue: Option<&str>) -> QueueResult<Option<Box<dyn ReservedJob>>> {
        let url = self.queue_url(queue);
        let response = self
            .client
            .receive_message()
            .queue_url(&url)
            .max_number_of_messages(1)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| unavailable("receive_message", e))?;

        let Some(message) = response.messages().first() else {
            return Ok(None);
        };
        let receipt_handle = message
            .receipt_handle()
            .ok_or_else(|| unavailable("receive_message", "missing receipt handle"))?
            .to_string();
        let raw = message.body().unwrap_or_default().to_string();
        let attempts = message
            .attributes()
            .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        debug!(url = %url, attempts, "received sqs message");

        let envelope = match Envelope::decode(&raw) {
            Ok(mut envelope) => {
                envelope.attempts = attempts;
                envelope
            }
            Err(e) => {
                warn!(url = %url, error = %e, "deleting malformed payload");
                self.client
                    .delete_message()
                    .queue_url(&url)
                    .receipt_handle(&receipt_handle)
                    .send()
                    .await
                    .map_err(|e| unavailable("delete_message", e))?;
                return Err(e);
            }
        };

        Ok(Some(Box::new(SqsJob {
            client: self.client.clone(),
            connection: self.connection.clone(),
            queue: queue.unwrap_or(&self.config.queue).to_string(),
            queue_url: url,
            receipt_handle,
            raw,
            envelope,
            state: JobState::new(),
        })))
    }
}

struct SqsJob {
    client: Client,
    connection: String,
    queue: String,
    queue_url: String,
    receipt_handle: String,
    raw: String,
    envelope: Envelope,
    state: JobState,
}

#[async_trait]
impl ReservedJob for SqsJob {
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
        self.envelope.attempts
    }

    fn state(&self) -> &JobState {
        &self.state
    }

    async fn delete(&self) -> QueueResult<()> {
        if !self.state.mark_deleted() {
            return Ok(());
        }
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .send()
            .await
            .map_err(|e| unavailable("delete_message", e))?;
        Ok(())
    }

    async fn release(&self, delay: Duration) -> QueueResult<()> {
        if self.state.is_deleted() || !self.state.mark_released() {
            return Ok(());
        }
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .visibility_timeout(visibility_timeout(delay)?)
            .send()
            .await
            .map_err(|e| unavailable("change_message_visibility", e))?;
        Ok(())
    }
}

/// Build an SQS client for `config` and wrap it.
pub async fn connect(
    connection: &str,
    config: &SqsConfig,
    resolver: Arc<dyn HandlerResolver>,
) -> QueueResult<SqsQueue> {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()));
    if let Some(endpoint) = &config.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
        loader = loader.credentials_provider(aws_sdk_sqs::config::Credentials::new(
            key.clone(),
            secret.clone(),
            None,
            None,
            "conveyor",
        ));
    }
    let sdk_config = loader.load().await;
    Ok(SqsQueue::new(
        connection,
        config.clone(),
        Client::new(&sdk_config),
        resolver,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerRegistry;

    fn queue(config: SqsConfig) -> SqsQueue {
        let sdk_config = aws_sdk_sqs::Config::builder()
            .behavior_version(aws_sdk_sqs::config::BehaviorVersion::latest())
            .build();
        SqsQueue::new(
            "sqs",
            config,
            Client::from_conf(sdk_config),
            Arc::new(HandlerRegistry::new()),
        )
    }

    #[test]
    fn queue_url_joins_prefix_and_name() {
        let q = queue(SqsConfig::new(
            "us-east-1",
            "https://sqs.us-east-1.amazonaws.com/123456789/",
        ));
        assert_eq!(
            q.queue_url(Some("emails")),
            "https://sqs.us-east-1.amazonaws.com/123456789/emails"
        );
    }

    #[test]
    fn queue_url_passes_full_urls_through() {
        let q = queue(SqsConfig::new("us-east-1", "unused"));
        let url = "https://sqs.us-east-1.amazonaws.com/123456789/direct";
        assert_eq!(q.queue_url(Some(url)), url);
    }

    #[test]
    fn release_backoff_is_not_capped_at_the_send_delay_limit() {
        // Backoffs past the 15-minute send cap are still valid visibility
        // timeouts; shortening them would redeliver early.
        let hour = Duration::from_secs(3600);
        assert_eq!(visibility_timeout(hour).unwrap(), 3600);
        assert_eq!(
            visibility_timeout(Duration::from_secs(MAX_VISIBILITY_SECONDS)).unwrap(),
            43_200
        );
    }

    #[test]
    fn visibility_past_the_twelve_hour_ceiling_is_rejected() {
        let err = visibility_timeout(Duration::from_secs(MAX_VISIBILITY_SECONDS + 1)).unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
    }
}
