//! Redis backend
//!
//! Each queue is a ready list plus two sorted sets, `:delayed` and
//! `:reserved`, scored by unix timestamp. All state transitions run as
//! server-side Lua so concurrent workers never see a job twice.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use crate::config::RedisConfig;
use crate::envelope::{Envelope, JobData};
use crate::error::QueueResult;
use crate::handler::HandlerResolver;
use crate::job::{JobState, ReservedJob};
use crate::queue::Queue;
use crate::time::{self, Delay};

/// Pop the next ready job and park a copy (with its attempt counter bumped)
/// in the reserved set, atomically.
const POP: &str = r#"
local job = redis.call('lpop', KEYS[1])
if job == false then
    return nil
end
local reserved = cjson.decode(job)
reserved['attempts'] = reserved['attempts'] + 1
reserved = cjson.encode(reserved)
redis.call('zadd', KEYS[2], ARGV[1], reserved)
return {job, reserved}
"#;

/// Move every entry scored at or before ARGV[1] from the sorted set KEYS[1]
/// onto the ready list KEYS[2].
const MIGRATE: &str = r#"
local val = redis.call('zrangebyscore', KEYS[1], '-inf', ARGV[1])
if next(val) ~= nil then
    redis.call('zremrangebyrank', KEYS[1], 0, #val - 1)
    for i = 1, #val, 100 do
        redis.call('rpush', KEYS[2], unpack(val, i, math.min(i + 99, #val)))
    end
end
return val
"#;

/// Move a reserved payload (KEYS[2]) onto the delayed set (KEYS[1]).
const RELEASE: &str = r#"
redis.call('zrem', KEYS[2], ARGV[1])
redis.call('zadd', KEYS[1], ARGV[2], ARGV[1])
return true
"#;

/// Redis-backed queue over a shared [`ConnectionManager`].
pub struct RedisQueue {
    connection: String,
    config: RedisConfig,
    manager: ConnectionManager,
    resolver: Arc<dyn HandlerResolver>,
}

impl RedisQueue {
    pub fn new(
        connection: impl Into<String>,
        config: RedisConfig,
        manager: ConnectionManager,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Self {
        Self {
            connection: connection.into(),
            config,
            manager,
            resolver,
        }
    }

    fn queue_name<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.unwrap_or(&self.config.queue)
    }

    fn ready_key(&self, queue: &str) -> String {
        format!("queues:{queue}")
    }

    async fn raw_push(&self, queue: &str, payload: &str) -> QueueResult<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.rpush(self.ready_key(queue), payload).await?;
        Ok(())
    }

    async fn delayed_push(&self, queue: &str, payload: &str, available_at: i64) -> QueueResult<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .zadd(format!("{}:delayed", self.ready_key(queue)), payload, available_at)
            .await?;
        Ok(())
    }

    /// Move due delayed jobs (and expired reservations, when enabled) back
    /// onto the ready list.
    async fn migrate(&self, queue: &str) -> QueueResult<()> {
        let ready = self.ready_key(queue);
        let now = time::current_time();
        let mut conn = self.manager.clone();

        let moved: Vec<String> = redis::Script::new(MIGRATE)
            .key(format!("{ready}:delayed"))
            .key(&ready)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        if !moved.is_empty() {
            debug!(queue, count = moved.len(), "migrated delayed jobs");
        }

        if self.config.retry_after.is_some() {
            let moved: Vec<String> = redis::Script::new(MIGRATE)
                .key(format!("{ready}:reserved"))
                .key(&ready)
                .arg(now)
                .invoke_async(&mut conn)
                .await?;
            if !moved.is_empty() {
                debug!(queue, count = moved.len(), "migrated expired reservations");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Queue for RedisQueue {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    async fn size(&self, queue: Option<&str>) -> QueueResult<u64> {
        let ready = self.ready_key(self.queue_name(queue));
        let mut conn = self.manager.clone();
        let pending: u64 = conn.llen(&ready).await?;
        let delayed: u64 = conn.zcard(format!("{ready}:delayed")).await?;
        let reserved: u64 = conn.zcard(format!("{ready}:reserved")).await?;
        Ok(pending + delayed + reserved)
    }

    async fn push(&self, job: &str, data: JobData, queue: Option<&str>) -> QueueResult<String> {
        let envelope = Envelope::new(self.resolver.as_ref(), job, data)?;
        self.raw_push(self.queue_name(queue), &envelope.encode()?)
            .await?;
        Ok(envelope.id)
    }

    async fn push_raw(&self, payload: &str, queue: Option<&str>) -> QueueResult<String> {
        let envelope = Envelope::decode(payload)?;
        self.raw_push(self.queue_name(queue), payload).await?;
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
        self.delayed_push(
            self.queue_name(queue),
            &envelope.encode()?,
            time::available_at(delay),
        )
        .await?;
        Ok(envelope.id)
    }

    async fn pop(&self, queue: Option<&str>) -> QueueResult<Option<Box<dyn ReservedJob>>> {
        let queue = self.queue_name(queue).to_string();
        self.migrate(&queue).await?;

        let ready = self.ready_key(&queue);
        let reserved_key = format!("{ready}:reserved");
        let expires_at = time::current_time() + self.config.retry_after.unwrap_or(60) as i64;

        let mut conn = self.manager.clone();
        let popped: Option<(String, String)> = redis::Script::new(POP)
            .key(&ready)
            .key(&reserved_key)
            .arg(expires_at)
            .invoke_async(&mut conn)
            .await?;
        let Some((raw, reserved)) = popped else {
            return Ok(None);
        };

        let envelope = match Envelope::decode(&reserved) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Drop the poison reservation so it cannot cycle forever.
                warn!(queue, error = %e, "deleting malformed payload");
                let _: i64 = conn.zrem(&reserved_key, &reserved).await?;
                return Err(e);
            }
        };

        Ok(Some(Box::new(RedisJob {
            manager: self.manager.clone(),
            connection: self.connection.clone(),
            queue,
            ready_key: ready,
            raw,
            reserved,
            envelope,
            state: JobState::new(),
        })))
    }
}

struct RedisJob {
    manager: ConnectionManager,
    connection: String,
    queue: String,
    ready_key: String,
    /// Payload as it sat on the ready list
    raw: String,
    /// Bumped copy sitting in the reserved set
    reserved: String,
    envelope: Envelope,
    state: JobState,
}

#[async_trait]
impl ReservedJob for RedisJob {
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
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .zrem(format!("{}:reserved", self.ready_key), &self.reserved)
            .await?;
        Ok(())
    }

    async fn release(&self, delay: Duration) -> QueueResult<()> {
        if self.state.is_deleted() || !self.state.mark_released() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let _: bool = redis::Script::new(RELEASE)
            .key(format!("{}:delayed", self.ready_key))
            .key(format!("{}:reserved", self.ready_key))
            .arg(&self.reserved)
            .arg(time::current_time() + delay.as_secs() as i64)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Connect a [`ConnectionManager`] for `config` and wrap it.
pub async fn connect(
    connection: &str,
    config: &RedisConfig,
    resolver: Arc<dyn HandlerResolver>,
) -> QueueResult<RedisQueue> {
    let client = redis::Client::open(config.url.as_str())?;
    let manager = ConnectionManager::new(client).await?;
    Ok(RedisQueue::new(
        connection,
        config.clone(),
        manager,
        resolver,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let config = RedisConfig::new("redis://localhost:6379").with_queue("emails");
        // Keys derive from the queue name, not the connection name.
        assert_eq!(format!("queues:{}", config.queue), "queues:emails");
    }

    #[test]
    fn scripts_reference_expected_slots() {
        // KEYS/ARGV drift between the scripts and their call sites is the
        // easiest way to corrupt a queue, so pin the shapes down.
        assert!(POP.contains("KEYS[1]") && POP.contains("KEYS[2]") && POP.contains("ARGV[1]"));
        assert!(MIGRATE.contains("zrangebyscore"));
        assert!(RELEASE.contains("zrem") && RELEASE.contains("zadd"));
    }
}
