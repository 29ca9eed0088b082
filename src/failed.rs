//! Failed-job ledger

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::QueueResult;

/// One terminally failed job.
#[derive(Debug, Clone)]
pub struct FailedJob {
    /// Ledger id
    pub id: u64,
    /// Connection the job came from
    pub connection: String,
    /// Queue the job came from
    pub queue: String,
    /// Raw payload, reusable for retries
    pub payload: String,
    /// Rendered error that failed it
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Durable record of terminal failures.
///
/// The worker writes exactly one entry per failed job; retry tooling reads
/// entries back, re-enqueues them, and forgets them.
#[async_trait]
pub trait FailedJobProvider: Send + Sync {
    /// Record a failure, returning the ledger id.
    async fn log(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
        error: &str,
    ) -> QueueResult<u64>;

    async fn all(&self) -> QueueResult<Vec<FailedJob>>;

    async fn find(&self, id: u64) -> QueueResult<Option<FailedJob>>;

    /// Remove one entry; false when it did not exist.
    async fn forget(&self, id: u64) -> QueueResult<bool>;

    /// Remove every entry, returning how many were removed.
    async fn flush(&self) -> QueueResult<u64>;
}

/// Process-local ledger.
#[derive(Default)]
pub struct InMemoryFailedJobProvider {
    entries: Mutex<Vec<FailedJob>>,
    next_id: AtomicU64,
}

impl InMemoryFailedJobProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FailedJobProvider for InMemoryFailedJobProvider {
    async fn log(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
        error: &str,
    ) -> QueueResult<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.lock().push(FailedJob {
            id,
            connection: connection.to_string(),
            queue: queue.to_string(),
            payload: payload.to_string(),
            error: error.to_string(),
            failed_at: Utc::now(),
        });
        Ok(id)
    }

    async fn all(&self) -> QueueResult<Vec<FailedJob>> {
        Ok(self.entries.lock().clone())
    }

    async fn find(&self, id: u64) -> QueueResult<Option<FailedJob>> {
        Ok(self.entries.lock().iter().find(|e| e.id == id).cloned())
    }

    async fn forget(&self, id: u64) -> QueueResult<bool> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        Ok(entries.len() < before)
    }

    async fn flush(&self) -> QueueResult<u64> {
        let mut entries = self.entries.lock();
        let count = entries.len() as u64;
        entries.clear();
        Ok(count)
    }
}

/// Ledger persisted in a database table, sharing the queue's pool.
#[cfg(feature = "database")]
pub struct DatabaseFailedJobProvider {
    pool: sqlx::AnyPool,
    table: String,
    dialect: crate::database::Dialect,
}

#[cfg(feature = "database")]
impl DatabaseFailedJobProvider {
    pub fn new(pool: sqlx::AnyPool, url: &str, table: impl Into<String>) -> QueueResult<Self> {
        let table = table.into();
        crate::database::check_identifier(&table)?;
        Ok(Self {
            pool,
            table,
            dialect: crate::database::Dialect::from_url(url)?,
        })
    }

    /// Create the ledger table when it does not exist yet.
    pub async fn migrate(&self) -> QueueResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             {pk}, \
             connection TEXT NOT NULL, \
             queue TEXT NOT NULL, \
             payload TEXT NOT NULL, \
             error TEXT NOT NULL, \
             failed_at BIGINT NOT NULL)",
            table = self.table,
            pk = self.dialect.auto_increment_pk(),
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_entry(&self, row: &sqlx::any::AnyRow) -> QueueResult<FailedJob> {
        use sqlx::Row;
        let failed_at: i64 = row.try_get("failed_at")?;
        Ok(FailedJob {
            id: row.try_get::<i64, _>("id")? as u64,
            connection: row.try_get("connection")?,
            queue: row.try_get("queue")?,
            payload: row.try_get("payload")?,
            error: row.try_get("error")?,
            failed_at: DateTime::from_timestamp(failed_at, 0).unwrap_or_else(Utc::now),
        })
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl FailedJobProvider for DatabaseFailedJobProvider {
    async fn log(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
        error: &str,
    ) -> QueueResult<u64> {
        use sqlx::Row;
        let d = self.dialect;
        let sql = format!(
            "INSERT INTO {table} (connection, queue, payload, error, failed_at) \
             VALUES ({p1}, {p2}, {p3}, {p4}, {p5})",
            table = self.table,
            p1 = d.placeholder(1),
            p2 = d.placeholder(2),
            p3 = d.placeholder(3),
            p4 = d.placeholder(4),
            p5 = d.placeholder(5),
        );
        sqlx::query(&sql)
            .bind(connection)
            .bind(queue)
            .bind(payload)
            .bind(error)
            .bind(crate::time::current_time())
            .execute(&self.pool)
            .await?;

        // Ids are monotonically assigned, so the newest row is ours.
        let sql = format!("SELECT MAX(id) AS id FROM {table}", table = self.table);
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        let id: i64 = row.try_get("id")?;
        Ok(id as u64)
    }

    async fn all(&self) -> QueueResult<Vec<FailedJob>> {
        let sql = format!(
            "SELECT id, connection, queue, payload, error, failed_at \
             FROM {table} ORDER BY id ASC",
            table = self.table,
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(|row| self.row_to_entry(row)).collect()
    }

    async fn find(&self, id: u64) -> QueueResult<Option<FailedJob>> {
        let sql = format!(
            "SELECT id, connection, queue, payload, error, failed_at \
             FROM {table} WHERE id = {p1}",
            table = self.table,
            p1 = self.dialect.placeholder(1),
        );
        let row = sqlx::query(&sql)
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(|row| self.row_to_entry(row)).transpose()
    }

    async fn forget(&self, id: u64) -> QueueResult<bool> {
        let sql = format!(
            "DELETE FROM {table} WHERE id = {p1}",
            table = self.table,
            p1 = self.dialect.placeholder(1),
        );
        let result = sqlx::query(&sql)
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn flush(&self) -> QueueResult<u64> {
        let sql = format!("DELETE FROM {table}", table = self.table);
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_ledger_round_trips() {
        let ledger = InMemoryFailedJobProvider::new();
        let id = ledger
            .log("database", "default", r#"{"id":"1"}"#, "boom")
            .await
            .unwrap();

        let entry = ledger.find(id).await.unwrap().unwrap();
        assert_eq!(entry.connection, "database");
        assert_eq!(entry.error, "boom");

        assert!(ledger.forget(id).await.unwrap());
        assert!(!ledger.forget(id).await.unwrap());
        assert!(ledger.find(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn flush_clears_everything() {
        let ledger = InMemoryFailedJobProvider::new();
        ledger.log("a", "q", "{}", "e1").await.unwrap();
        ledger.log("b", "q", "{}", "e2").await.unwrap();
        assert_eq!(ledger.flush().await.unwrap(), 2);
        assert!(ledger.all().await.unwrap().is_empty());
    }
}
