//! Beanstalk backend
//!
//! Speaks the beanstalkd text protocol directly over TCP. Only the handful
//! of commands the queue needs are implemented: tube selection, put,
//! reserve, release, bury, delete, and the two stats calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::BeanstalkdConfig;
use crate::envelope::{Envelope, JobData};
use crate::error::{QueueError, QueueResult};
use crate::handler::HandlerResolver;
use crate::job::{JobState, ReservedJob};
use crate::queue::Queue;
use crate::time::{self, Delay};

/// Default job priority, matching the common client default.
const DEFAULT_PRIORITY: u32 = 1024;

struct Inner {
    stream: BufStream<TcpStream>,
    using: String,
    watching: String,
}

impl Inner {
    /// Send one command line (plus optional body) and read the reply line.
    async fn command(&mut self, line: &str, body: Option<&[u8]>) -> QueueResult<String> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        if let Some(body) = body {
            self.stream.write_all(body).await?;
            self.stream.write_all(b"\r\n").await?;
        }
        self.stream.flush().await?;

        let mut reply = String::new();
        self.stream.read_line(&mut reply).await?;
        if reply.is_empty() {
            return Err(QueueError::Unavailable(
                "beanstalkd closed the connection".into(),
            ));
        }
        Ok(reply.trim_end().to_string())
    }

    /// Read a `<bytes>` data section followed by its trailing CRLF.
    async fn read_body(&mut self, len: usize) -> QueueResult<Vec<u8>> {
        let mut buf = vec![0u8; len + 2];
        self.stream.read_exact(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    async fn use_tube(&mut self, tube: &str) -> QueueResult<()> {
        if self.using == tube {
            return Ok(());
        }
        let reply = self.command(&format!("use {tube}"), None).await?;
        if !reply.starts_with("USING") {
            return Err(protocol_error("use", &reply));
        }
        self.using = tube.to_string();
        Ok(())
    }

    async fn watch_tube(&mut self, tube: &str) -> QueueResult<()> {
        if self.watching == tube {
            return Ok(());
        }
        let reply = self.command(&format!("watch {tube}"), None).await?;
        if !reply.starts_with("WATCHING") {
            return Err(protocol_error("watch", &reply));
        }
        // One tube watched at a time; drop the previous one. NOT_IGNORED
        // only happens for the last watched tube, which cannot be the case
        // after a successful watch.
        let previous = std::mem::replace(&mut self.watching, tube.to_string());
        let reply = self.command(&format!("ignore {previous}"), None).await?;
        if !reply.starts_with("WATCHING") && !reply.starts_with("NOT_IGNORED") {
            return Err(protocol_error("ignore", &reply));
        }
        Ok(())
    }
}

fn protocol_error(command: &str, reply: &str) -> QueueError {
    QueueError::Unavailable(format!("beanstalkd {command} failed: {reply}"))
}

/// Minimal beanstalkd client. One TCP connection, serialized by a mutex.
pub struct BeanstalkdClient {
    inner: Mutex<Inner>,
}

impl BeanstalkdClient {
    pub async fn connect(host: &str, port: u16) -> QueueResult<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        debug!(host, port, "connected to beanstalkd");
        Ok(Self {
            inner: Mutex::new(Inner {
                stream: BufStream::new(stream),
                using: "default".to_string(),
                watching: "default".to_string(),
            }),
        })
    }

    /// `put` into `tube`, returning the broker job id.
    pub async fn put(
        &self,
        tube: &str,
        payload: &[u8],
        priority: u32,
        delay: u64,
        ttr: u64,
    ) -> QueueResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.use_tube(tube).await?;
        let line = format!("put {priority} {delay} {ttr} {}", payload.len());
        let reply = inner.command(&line, Some(payload)).await?;
        match reply.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["INSERTED", id] => id
                .parse()
                .map_err(|_| protocol_error("put", &reply)),
            _ => Err(protocol_error("put", &reply)),
        }
    }

    /// Non-blocking reserve from `tube`. `None` when nothing is ready.
    pub async fn reserve(&self, tube: &str) -> QueueResult<Option<(u64, Vec<u8>)>> {
        let mut inner = self.inner.lock().await;
        inner.watch_tube(tube).await?;
        let reply = inner.command("reserve-with-timeout 0", None).await?;
        match reply.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["RESERVED", id, bytes] => {
                let id: u64 = id.parse().map_err(|_| protocol_error("reserve", &reply))?;
                let len: usize = bytes
                    .parse()
                    .map_err(|_| protocol_error("reserve", &reply))?;
                let body = inner.read_body(len).await?;
                Ok(Some((id, body)))
            }
            ["TIMED_OUT"] | ["DEADLINE_SOON"] => Ok(None),
            _ => Err(protocol_error("reserve", &reply)),
        }
    }

    pub async fn delete(&self, id: u64) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        let reply = inner.command(&format!("delete {id}"), None).await?;
        // NOT_FOUND means someone else already removed it, which is fine
        // for an idempotent delete.
        if reply.starts_with("DELETED") || reply.starts_with("NOT_FOUND") {
            Ok(())
        } else {
            Err(protocol_error("delete", &reply))
        }
    }

    pub async fn release(&self, id: u64, priority: u32, delay: u64) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        let reply = inner
            .command(&format!("release {id} {priority} {delay}"), None)
            .await?;
        if reply.starts_with("RELEASED") {
            Ok(())
        } else {
            Err(protocol_error("release", &reply))
        }
    }

    pub async fn bury(&self, id: u64, priority: u32) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        let reply = inner.command(&format!("bury {id} {priority}"), None).await?;
        if reply.starts_with("BURIED") {
            Ok(())
        } else {
            Err(protocol_error("bury", &reply))
        }
    }

    async fn stats(&self, command: &str) -> QueueResult<Vec<(String, String)>> {
        let mut inner = self.inner.lock().await;
        let reply = inner.command(command, None).await?;
        match reply.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["OK", bytes] => {
                let len: usize = bytes
                    .parse()
                    .map_err(|_| protocol_error(command, &reply))?;
                let body = inner.read_body(len).await?;
                Ok(parse_stats(&String::from_utf8_lossy(&body)))
            }
            _ => Err(protocol_error(command, &reply)),
        }
    }

    /// `stats-job`, as simple key/value pairs.
    pub async fn stats_job(&self, id: u64) -> QueueResult<Vec<(String, String)>> {
        self.stats(&format!("stats-job {id}")).await
    }

    /// `stats-tube`, as simple key/value pairs.
    pub async fn stats_tube(&self, tube: &str) -> QueueResult<Vec<(String, String)>> {
        self.stats(&format!("stats-tube {tube}")).await
    }
}

/// The stats replies are a flat YAML mapping; a line splitter is all it takes.
fn parse_stats(body: &str) -> Vec<(String, String)> {
    body.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn stat_u64(stats: &[(String, String)], key: &str) -> u64 {
    stats
        .iter()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0)
}

/// Beanstalk-backed queue.
pub struct BeanstalkdQueue {
    connection: String,
    config: BeanstalkdConfig,
    client: Arc<BeanstalkdClient>,
    resolver: Arc<dyn HandlerResolver>,
}

impl BeanstalkdQueue {
    pub fn new(
        connection: impl Into<String>,
        config: BeanstalkdConfig,
        client: Arc<BeanstalkdClient>,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Self {
        Self {
            connection: connection.into(),
            config,
            client,
            resolver,
        }
    }

    fn tube<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.unwrap_or(&self.config.queue)
    }

    async fn put(&self, tube: &str, payload: &str, delay: u64) -> QueueResult<u64> {
        self.client
            .put(
                tube,
                payload.as_bytes(),
                DEFAULT_PRIORITY,
                delay,
                self.config.time_to_run,
            )
            .await
    }
}

#[async_trait]
impl Queue for BeanstalkdQueue {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    async fn size(&self, queue: Option<&str>) -> QueueResult<u64> {
        let stats = self.client.stats_tube(self.tube(queue)).await?;
        Ok(stat_u64(&stats, "current-jobs-ready")
            + stat_u64(&stats, "current-jobs-delayed")
            + stat_u64(&stats, "current-jobs-reserved"))
    }

    async fn push(&self, job: &str, data: JobData, queue: Option<&str>) -> QueueResult<String> {
        let envelope = Envelope::new(self.resolver.as_ref(), job, data)?;
        self.put(self.tube(queue), &envelope.encode()?, 0).await?;
        Ok(envelope.id)
    }

    async fn push_raw(&self, payload: &str, queue: Option<&str>) -> QueueResult<String> {
        let envelope = Envelope::decode(payload)?;
        self.put(self.tube(queue), payload, 0).await?;
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
        self.put(
            self.tube(queue),
            &envelope.encode()?,
            time::seconds_until(delay),
        )
        .await?;
        Ok(envelope.id)
    }

    async fn pop(&self, queue: Option<&str>) -> QueueResult<Option<Box<dyn ReservedJob>>> {
        let tube = self.tube(queue).to_string();
        let Some((id, body)) = self.client.reserve(&tube).await? else {
            return Ok(None);
        };
        let raw = String::from_utf8_lossy(&body).into_owned();

        let envelope = match Envelope::decode(&raw) {
            Ok(mut envelope) => {
                // The broker counts reservations for us; the current one is
                // included, so `reserves` is already 1-based.
                let stats = self.client.stats_job(id).await?;
                envelope.attempts = stat_u64(&stats, "reserves") as u32;
                envelope
            }
            Err(e) => {
                warn!(id, tube, error = %e, "deleting malformed payload");
                self.client.delete(id).await?;
                return Err(e);
            }
        };

        Ok(Some(Box::new(BeanstalkdJob {
            client: self.client.clone(),
            connection: self.connection.clone(),
            queue: tube,
            broker_id: id,
            raw,
            envelope,
            state: JobState::new(),
        })))
    }
}

/// A job reserved from a tube.
pub struct BeanstalkdJob {
    client: Arc<BeanstalkdClient>,
    connection: String,
    queue: String,
    broker_id: u64,
    raw: String,
    envelope: Envelope,
    state: JobState,
}

impl BeanstalkdJob {
    /// Park the job in the tube's buried list for manual inspection.
    pub async fn bury(&self) -> QueueResult<()> {
        self.client.bury(self.broker_id, DEFAULT_PRIORITY).await
    }
}

#[async_trait]
impl ReservedJob for BeanstalkdJob {
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
        self.client.delete(self.broker_id).await
    }

    async fn release(&self, delay: Duration) -> QueueResult<()> {
        if self.state.is_deleted() || !self.state.mark_released() {
            return Ok(());
        }
        self.client
            .release(self.broker_id, DEFAULT_PRIORITY, delay.as_secs())
            .await
    }
}

/// Connect a client for `config` and wrap it.
pub async fn connect(
    connection: &str,
    config: &BeanstalkdConfig,
    resolver: Arc<dyn HandlerResolver>,
) -> QueueResult<BeanstalkdQueue> {
    let client = BeanstalkdClient::connect(&config.host, config.port).await?;
    Ok(BeanstalkdQueue::new(
        connection,
        config.clone(),
        Arc::new(client),
        resolver,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stats_body() {
        let body = "---\nid: 42\ntube: default\nreserves: 3\ncurrent-jobs-ready: 7\n";
        let stats = parse_stats(body);
        assert_eq!(stat_u64(&stats, "reserves"), 3);
        assert_eq!(stat_u64(&stats, "current-jobs-ready"), 7);
        assert_eq!(stat_u64(&stats, "missing"), 0);
    }

    #[test]
    fn stats_tolerate_junk_lines() {
        let stats = parse_stats("---\nnot a pair\nkey: value\n");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0], ("key".to_string(), "value".to_string()));
    }
}
