//! Relational-database backend
//!
//! Jobs live in a single table and workers claim them with a
//! compare-and-swap UPDATE, so any number of workers can poll the same
//! table without a job being handed out twice.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use tracing::{debug, warn};

use crate::config::DatabaseConfig;
use crate::envelope::{Envelope, JobData};
use crate::error::{QueueError, QueueResult};
use crate::handler::HandlerResolver;
use crate::job::{JobState, ReservedJob};
use crate::queue::Queue;
use crate::time::{self, Delay};

/// SQL flavor, sniffed from the connection URL.
///
/// The `Any` driver does not translate placeholders, so query text is built
/// per dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    Sqlite,
    Postgres,
    MySql,
}

impl Dialect {
    pub(crate) fn from_url(url: &str) -> QueueResult<Self> {
        if url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Ok(Dialect::Postgres)
        } else if url.starts_with("mysql:") || url.starts_with("mariadb:") {
            Ok(Dialect::MySql)
        } else {
            Err(QueueError::Config(format!(
                "unsupported database url '{url}'"
            )))
        }
    }

    /// Placeholder for the `n`th bind parameter (1-based).
    pub(crate) fn placeholder(self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${n}"),
            Dialect::Sqlite | Dialect::MySql => "?".to_string(),
        }
    }

    pub(crate) fn auto_increment_pk(self) -> &'static str {
        match self {
            Dialect::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
            Dialect::Postgres => "id BIGSERIAL PRIMARY KEY",
            Dialect::MySql => "id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY",
        }
    }
}

/// Validate a table identifier before interpolating it into SQL.
pub(crate) fn check_identifier(name: &str) -> QueueResult<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(QueueError::Config(format!("invalid table name '{name}'")))
    }
}

/// Database-backed queue over a shared [`AnyPool`].
pub struct DatabaseQueue {
    connection: String,
    config: DatabaseConfig,
    pool: AnyPool,
    resolver: Arc<dyn HandlerResolver>,
}

impl DatabaseQueue {
    pub fn new(
        connection: impl Into<String>,
        config: DatabaseConfig,
        pool: AnyPool,
        resolver: Arc<dyn HandlerResolver>,
    ) -> QueueResult<Self> {
        check_identifier(&config.table)?;
        Ok(Self {
            connection: connection.into(),
            config,
            pool,
            resolver,
        })
    }

    /// The underlying pool, for operator tooling and tests.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    fn dialect(&self) -> QueueResult<Dialect> {
        Dialect::from_url(&self.config.url)
    }

    /// Create the jobs table when it does not exist yet.
    pub async fn migrate(&self) -> QueueResult<()> {
        let d = self.dialect()?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             {pk}, \
             queue TEXT NOT NULL, \
             payload TEXT NOT NULL, \
             attempts BIGINT NOT NULL DEFAULT 0, \
             reserved_at BIGINT, \
             available_at BIGINT NOT NULL, \
             created_at BIGINT NOT NULL)",
            table = self.config.table,
            pk = d.auto_increment_pk(),
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    fn queue_name<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.unwrap_or(&self.config.queue)
    }

    async fn insert(
        &self,
        queue: &str,
        payload: &str,
        attempts: i64,
        available_at: i64,
    ) -> QueueResult<()> {
        let d = self.dialect()?;
        let sql = format!(
            "INSERT INTO {table} (queue, payload, attempts, reserved_at, available_at, created_at) \
             VALUES ({p1}, {p2}, {p3}, NULL, {p4}, {p5})",
            table = self.config.table,
            p1 = d.placeholder(1),
            p2 = d.placeholder(2),
            p3 = d.placeholder(3),
            p4 = d.placeholder(4),
            p5 = d.placeholder(5),
        );
        sqlx::query(&sql)
            .bind(queue)
            .bind(payload)
            .bind(attempts)
            .bind(available_at)
            .bind(time::current_time())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Oldest eligible row id cutoff for abandoned reservations.
    fn reservation_cutoff(&self) -> i64 {
        time::current_time() - self.config.retry_after as i64
    }

    async fn claim_next(&self, queue: &str) -> QueueResult<Option<ClaimedRow>> {
        let d = self.dialect()?;
        let table = &self.config.table;

        // Select-then-CAS: losing the race just means another worker claimed
        // the row first, so go around again.
        loop {
            let now = time::current_time();
            let cutoff = self.reservation_cutoff();
            let select = format!(
                "SELECT id, payload, attempts FROM {table} \
                 WHERE queue = {p1} AND \
                 ((reserved_at IS NULL AND available_at <= {p2}) OR reserved_at <= {p3}) \
                 ORDER BY id ASC LIMIT 1",
                p1 = d.placeholder(1),
                p2 = d.placeholder(2),
                p3 = d.placeholder(3),
            );
            let row = sqlx::query(&select)
                .bind(queue)
                .bind(now)
                .bind(cutoff)
                .fetch_optional(&self.pool)
                .await?;

            let Some(row) = row else {
                return Ok(None);
            };
            let id: i64 = row.try_get("id")?;
            let payload: String = row.try_get("payload")?;
            let attempts: i64 = row.try_get("attempts")?;

            let update = format!(
                "UPDATE {table} SET reserved_at = {p1}, attempts = attempts + 1 \
                 WHERE id = {p2} AND \
                 ((reserved_at IS NULL AND available_at <= {p3}) OR reserved_at <= {p4})",
                p1 = d.placeholder(1),
                p2 = d.placeholder(2),
                p3 = d.placeholder(3),
                p4 = d.placeholder(4),
            );
            let result = sqlx::query(&update)
                .bind(now)
                .bind(id)
                .bind(now)
                .bind(cutoff)
                .execute(&self.pool)
                .await?;

            if result.rows_affected() == 1 {
                return Ok(Some(ClaimedRow {
                    id,
                    payload,
                    attempts: attempts + 1,
                }));
            }
            debug!(id, queue, "lost claim race, retrying");
        }
    }

    pub(crate) async fn delete_row(&self, id: i64) -> QueueResult<()> {
        let d = self.dialect()?;
        let sql = format!(
            "DELETE FROM {table} WHERE id = {p1}",
            table = self.config.table,
            p1 = d.placeholder(1),
        );
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }
}

struct ClaimedRow {
    id: i64,
    payload: String,
    attempts: i64,
}

#[async_trait]
impl Queue for DatabaseQueue {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    async fn size(&self, queue: Option<&str>) -> QueueResult<u64> {
        let d = self.dialect()?;
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {table} WHERE queue = {p1}",
            table = self.config.table,
            p1 = d.placeholder(1),
        );
        let row = sqlx::query(&sql)
            .bind(self.queue_name(queue))
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn push(&self, job: &str, data: JobData, queue: Option<&str>) -> QueueResult<String> {
        let envelope = Envelope::new(self.resolver.as_ref(), job, data)?;
        let payload = envelope.encode()?;
        self.insert(self.queue_name(queue), &payload, 0, time::current_time())
            .await?;
        Ok(envelope.id)
    }

    async fn push_raw(&self, payload: &str, queue: Option<&str>) -> QueueResult<String> {
        let envelope = Envelope::decode(payload)?;
        self.insert(self.queue_name(queue), payload, 0, time::current_time())
            .await?;
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
        let payload = envelope.encode()?;
        self.insert(
            self.queue_name(queue),
            &payload,
            0,
            time::available_at(delay),
        )
        .await?;
        Ok(envelope.id)
    }

    async fn pop(&self, queue: Option<&str>) -> QueueResult<Option<Box<dyn ReservedJob>>> {
        let queue = self.queue_name(queue);
        let Some(claimed) = self.claim_next(queue).await? else {
            return Ok(None);
        };

        let envelope = match Envelope::decode(&claimed.payload) {
            Ok(mut envelope) => {
                envelope.attempts = claimed.attempts as u32;
                envelope
            }
            Err(e) => {
                // Poison message: drop it so it cannot wedge the queue.
                warn!(id = claimed.id, queue, error = %e, "deleting malformed payload");
                self.delete_row(claimed.id).await?;
                return Err(e);
            }
        };

        Ok(Some(Box::new(DatabaseJob {
            backend: DatabaseBackend {
                connection: self.connection.clone(),
                config: self.config.clone(),
                pool: self.pool.clone(),
            },
            row_id: claimed.id,
            raw: claimed.payload,
            envelope,
            queue: queue.to_string(),
            state: JobState::new(),
        })))
    }
}

/// Slim handle the reserved job keeps for its own delete/release calls.
struct DatabaseBackend {
    connection: String,
    config: DatabaseConfig,
    pool: AnyPool,
}

impl DatabaseBackend {
    fn dialect(&self) -> QueueResult<Dialect> {
        Dialect::from_url(&self.config.url)
    }

    async fn delete_row(&self, id: i64) -> QueueResult<()> {
        let d = self.dialect()?;
        let sql = format!(
            "DELETE FROM {table} WHERE id = {p1}",
            table = self.config.table,
            p1 = d.placeholder(1),
        );
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn reinsert(
        &self,
        queue: &str,
        payload: &str,
        attempts: i64,
        available_at: i64,
    ) -> QueueResult<()> {
        let d = self.dialect()?;
        let sql = format!(
            "INSERT INTO {table} (queue, payload, attempts, reserved_at, available_at, created_at) \
             VALUES ({p1}, {p2}, {p3}, NULL, {p4}, {p5})",
            table = self.config.table,
            p1 = d.placeholder(1),
            p2 = d.placeholder(2),
            p3 = d.placeholder(3),
            p4 = d.placeholder(4),
            p5 = d.placeholder(5),
        );
        sqlx::query(&sql)
            .bind(queue)
            .bind(payload)
            .bind(attempts)
            .bind(available_at)
            .bind(time::current_time())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

struct DatabaseJob {
    backend: DatabaseBackend,
    row_id: i64,
    raw: String,
    envelope: Envelope,
    queue: String,
    state: JobState,
}

#[async_trait]
impl ReservedJob for DatabaseJob {
    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn raw_payload(&self) -> &str {
        &self.raw
    }

    fn connection(&self) -> &str {
        &self.backend.connection
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
        self.backend.delete_row(self.row_id).await
    }

    async fn release(&self, delay: Duration) -> QueueResult<()> {
        if self.state.is_deleted() || !self.state.mark_released() {
            return Ok(());
        }
        // Release is reinsert-then-delete so the attempt count survives the
        // round trip.
        self.backend
            .reinsert(
                &self.queue,
                &self.raw,
                self.envelope.attempts as i64,
                time::current_time() + delay.as_secs() as i64,
            )
            .await?;
        self.backend.delete_row(self.row_id).await
    }
}

/// Connect a pool for `config` and wrap it in a [`DatabaseQueue`].
pub async fn connect(
    connection: &str,
    config: &DatabaseConfig,
    resolver: Arc<dyn HandlerResolver>,
) -> QueueResult<DatabaseQueue> {
    sqlx::any::install_default_drivers();
    let pool = sqlx::any::AnyPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;
    DatabaseQueue::new(connection, config.clone(), pool, resolver)
}
