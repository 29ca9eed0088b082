//! AMQP 0.9.1 backend
//!
//! Jobs publish to the default exchange with the queue name as routing key.
//! Delays use per-duration dead-letter queues: a message published into
//! `<queue>.delayed.<secs>` expires after its TTL and is routed back onto
//! the real queue by the broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, warn};

use crate::config::AmqpConfig;
use crate::envelope::{Envelope, JobData};
use crate::error::QueueResult;
use crate::handler::HandlerResolver;
use crate::job::{JobState, ReservedJob};
use crate::queue::Queue;
use crate::time::{self, Delay};

/// AMQP-backed queue over one channel.
pub struct AmqpQueue {
    connection: String,
    config: AmqpConfig,
    // Held so the channel outlives us.
    _amqp: Connection,
    channel: Channel,
    resolver: Arc<dyn HandlerResolver>,
}

async fn declare(channel: &Channel, queue: &str) -> QueueResult<lapin::Queue> {
    let declared = channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(declared)
}

/// Declare the dead-letter queue that feeds `queue` after `delay` and
/// return its name.
async fn declare_delayed(channel: &Channel, queue: &str, delay: u64) -> QueueResult<String> {
    let name = format!("{queue}.delayed.{delay}");
    let mut args = FieldTable::default();
    args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(queue.into()),
    );
    args.insert(
        "x-message-ttl".into(),
        AMQPValue::LongLongInt((delay * 1000) as i64),
    );
    channel
        .queue_declare(
            &name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await?;
    Ok(name)
}

async fn publish(channel: &Channel, routing_key: &str, payload: &str) -> QueueResult<()> {
    let _confirm = channel
        .basic_publish(
            "",
            routing_key,
            BasicPublishOptions::default(),
            payload.as_bytes(),
            BasicProperties::default().with_delivery_mode(2),
        )
        .await?;
    debug!(routing_key, "published job");
    Ok(())
}

/// Publish onto `queue`, routing through its per-delay dead-letter queue
/// when `delay` is non-zero.
async fn publish_with_delay(
    channel: &Channel,
    queue: &str,
    payload: &str,
    delay: u64,
) -> QueueResult<()> {
    declare(channel, queue).await?;
    if delay == 0 {
        publish(channel, queue, payload).await
    } else {
        let delayed = declare_delayed(channel, queue, delay).await?;
        publish(channel, &delayed, payload).await
    }
}

impl AmqpQueue {
    fn queue_name<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.unwrap_or(&self.config.queue)
    }
}

#[async_trait]
impl Queue for AmqpQueue {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    async fn size(&self, queue: Option<&str>) -> QueueResult<u64> {
        let declared = declare(&self.channel, self.queue_name(queue)).await?;
        Ok(declared.message_count() as u64)
    }

    async fn push(&self, job: &str, data: JobData, queue: Option<&str>) -> QueueResult<String> {
        let envelope = Envelope::new(self.resolver.as_ref(), job, data)?;
        publish_with_delay(&self.channel, self.queue_name(queue), &envelope.encode()?, 0).await?;
        Ok(envelope.id)
    }

    async fn push_raw(&self, payload: &str, queue: Option<&str>) -> QueueResult<String> {
        let envelope = Envelope::decode(payload)?;
        publish_with_delay(&self.channel, self.queue_name(queue), payload, 0).await?;
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
        publish_with_delay(
            &self.channel,
            self.queue_name(queue),
            &envelope.encode()?,
            time::seconds_until(delay),
        )
        .await?;
        Ok(envelope.id)
    }

    async fn pop(&self, queue: Option<&str>) -> QueueResult<Option<Box<dyn ReservedJob>>> {
        let queue = self.queue_name(queue).to_string();
        declare(&self.channel, &queue).await?;

        let Some(message) = self
            .channel
            .basic_get(&queue, BasicGetOptions { no_ack: false })
            .await?
        else {
            return Ok(None);
        };
        let raw = String::from_utf8_lossy(&message.delivery.data).into_owned();
        let acker = message.delivery.acker.clone();

        let envelope = match Envelope::decode(&raw) {
            Ok(mut envelope) => {
                // The counter travels in the payload; this delivery is one
                // more attempt.
                envelope.attempts += 1;
                envelope
            }
            Err(e) => {
                warn!(queue, error = %e, "acking malformed payload");
                acker.ack(BasicAckOptions::default()).await?;
                return Err(e);
            }
        };

        Ok(Some(Box::new(AmqpJob {
            channel: self.channel.clone(),
            acker,
            connection: self.connection.clone(),
            queue,
            raw,
            envelope,
            state: JobState::new(),
        })))
    }
}

struct AmqpJob {
    channel: Channel,
    acker: Acker,
    connection: String,
    queue: String,
    raw: String,
    envelope: Envelope,
    state: JobState,
}

#[async_trait]
impl ReservedJob for AmqpJob {
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
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn release(&self, delay: Duration) -> QueueResult<()> {
        if self.state.is_deleted() || !self.state.mark_released() {
            return Ok(());
        }
        // Republish the bumped envelope so the attempt count survives, then
        // ack the original delivery.
        let payload = self.envelope.encode()?;
        publish_with_delay(&self.channel, &self.queue, &payload, delay.as_secs()).await?;
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }
}

/// Open a connection and channel for `config` and wrap them.
pub async fn connect(
    connection: &str,
    config: &AmqpConfig,
    resolver: Arc<dyn HandlerResolver>,
) -> QueueResult<AmqpQueue> {
    let amqp = Connection::connect(&config.url, ConnectionProperties::default()).await?;
    let channel = amqp.create_channel().await?;
    if let Some(prefetch) = config.prefetch {
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
    }
    Ok(AmqpQueue {
        connection: connection.to_string(),
        config: config.clone(),
        _amqp: amqp,
        channel,
        resolver,
    })
}
