//! Integration tests for the database backend, run against in-memory sqlite.

#![cfg(feature = "database")]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor::database::DatabaseQueue;
use conveyor::prelude::*;
use serde_json::json;

struct Noop;

#[async_trait]
impl JobHandler for Noop {
    async fn fire(&self, _job: &dyn ReservedJob, _data: &JobData) -> QueueResult<()> {
        Ok(())
    }

    fn max_tries(&self) -> Option<u32> {
        Some(3)
    }
}

async fn make_queue(retry_after: u64) -> DatabaseQueue {
    sqlx::any::install_default_drivers();
    // One connection: each pool gets its own private in-memory database.
    let pool = sqlx::any::AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();

    let registry = Arc::new(HandlerRegistry::new());
    registry.register("noop", Arc::new(Noop));

    let config = DatabaseConfig::new("sqlite::memory:")
        .with_retry_after(retry_after)
        .with_max_connections(1);
    let queue = DatabaseQueue::new("database", config, pool, registry).unwrap();
    queue.migrate().await.unwrap();
    queue
}

#[tokio::test]
async fn push_pop_round_trip() {
    let queue = make_queue(60).await;

    let id = queue.push("noop", json!({"n": 42}), None).await.unwrap();
    assert_eq!(queue.size(None).await.unwrap(), 1);

    let job = queue.pop(None).await.unwrap().unwrap();
    assert_eq!(job.job_id(), id);
    assert_eq!(job.name(), "noop");
    assert_eq!(job.envelope().data, json!({"n": 42}));
    assert_eq!(job.envelope().max_tries, Some(3));
    assert_eq!(job.attempts(), 1);
    assert_eq!(job.queue(), "default");
    assert_eq!(job.connection(), "database");
}

#[tokio::test]
async fn reserved_jobs_are_not_handed_out_twice() {
    let queue = make_queue(60).await;
    queue.push("noop", json!({}), None).await.unwrap();

    let first = queue.pop(None).await.unwrap();
    assert!(first.is_some());
    let second = queue.pop(None).await.unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn racing_pops_claim_a_job_exactly_once() {
    // A file-backed database so two pool connections see the same rows.
    sqlx::any::install_default_drivers();
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("jobs.db").display());
    let pool = sqlx::any::AnyPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .unwrap();

    let registry = Arc::new(HandlerRegistry::new());
    registry.register("noop", Arc::new(Noop));
    let config = DatabaseConfig::new(&url).with_max_connections(2);
    let queue = Arc::new(DatabaseQueue::new("database", config, pool, registry).unwrap());
    queue.migrate().await.unwrap();

    for round in 0..20 {
        queue.push("noop", json!({"round": round}), None).await.unwrap();

        let a = tokio::spawn({
            let queue = queue.clone();
            async move { queue.pop(None).await.unwrap() }
        });
        let b = tokio::spawn({
            let queue = queue.clone();
            async move { queue.pop(None).await.unwrap() }
        });
        let (a, b) = tokio::join!(a, b);
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(
            a.is_some() as u32 + b.is_some() as u32,
            1,
            "round {round}: both pops claimed the same row"
        );
        a.or(b).unwrap().delete().await.unwrap();
    }
}

#[tokio::test]
async fn expired_reservations_are_reclaimed_with_a_higher_attempt() {
    let queue = make_queue(1).await;
    queue.push("noop", json!({}), None).await.unwrap();

    let job = queue.pop(None).await.unwrap().unwrap();
    assert_eq!(job.attempts(), 1);
    drop(job); // worker died without deleting or releasing

    assert!(queue.pop(None).await.unwrap().is_none());
    tokio::time::sleep(Duration::from_secs(2)).await;

    let job = queue.pop(None).await.unwrap().unwrap();
    assert_eq!(job.attempts(), 2);
}

#[tokio::test]
async fn delayed_jobs_become_available_after_the_delay() {
    let queue = make_queue(60).await;
    queue
        .later(Delay::For(Duration::from_secs(1)), "noop", json!({}), None)
        .await
        .unwrap();

    assert!(queue.pop(None).await.unwrap().is_none());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(queue.pop(None).await.unwrap().is_some());
}

#[tokio::test]
async fn release_returns_the_job_with_attempts_preserved() {
    let queue = make_queue(60).await;
    queue.push("noop", json!({}), None).await.unwrap();

    let job = queue.pop(None).await.unwrap().unwrap();
    assert_eq!(job.attempts(), 1);
    job.release(Duration::ZERO).await.unwrap();
    assert!(job.is_released());

    let job = queue.pop(None).await.unwrap().unwrap();
    assert_eq!(job.attempts(), 2);
}

#[tokio::test]
async fn delete_is_idempotent_and_removes_the_row() {
    let queue = make_queue(60).await;
    queue.push("noop", json!({}), None).await.unwrap();

    let job = queue.pop(None).await.unwrap().unwrap();
    job.delete().await.unwrap();
    job.delete().await.unwrap();
    assert!(job.is_deleted());

    assert_eq!(queue.size(None).await.unwrap(), 0);
    assert!(queue.pop(None).await.unwrap().is_none());
}

#[tokio::test]
async fn release_after_delete_is_a_no_op() {
    let queue = make_queue(60).await;
    queue.push("noop", json!({}), None).await.unwrap();

    let job = queue.pop(None).await.unwrap().unwrap();
    job.delete().await.unwrap();
    job.release(Duration::ZERO).await.unwrap();

    assert_eq!(queue.size(None).await.unwrap(), 0);
}

#[tokio::test]
async fn queues_are_isolated() {
    let queue = make_queue(60).await;
    queue.push("noop", json!({}), Some("emails")).await.unwrap();

    assert!(queue.pop(Some("reports")).await.unwrap().is_none());
    assert_eq!(queue.size(Some("emails")).await.unwrap(), 1);

    let job = queue.pop(Some("emails")).await.unwrap().unwrap();
    assert_eq!(job.queue(), "emails");
}

#[tokio::test]
async fn bulk_pushes_every_job() {
    let queue = make_queue(60).await;
    queue
        .bulk(&["noop", "noop", "noop"], json!({"shared": true}), None)
        .await
        .unwrap();
    assert_eq!(queue.size(None).await.unwrap(), 3);
}

#[tokio::test]
async fn malformed_payloads_are_deleted_not_recycled() {
    let queue = make_queue(60).await;

    sqlx::query(
        "INSERT INTO jobs (queue, payload, attempts, reserved_at, available_at, created_at) \
         VALUES ('default', 'not json', 0, NULL, 0, 0)",
    )
    .execute(queue.pool())
    .await
    .unwrap();

    let err = queue.pop(None).await.unwrap_err();
    assert!(matches!(err, QueueError::Payload(_)));
    // Gone for good, not re-served.
    assert_eq!(queue.size(None).await.unwrap(), 0);
    assert!(queue.pop(None).await.unwrap().is_none());
}

#[tokio::test]
async fn push_raw_keeps_the_payload_untouched() {
    let queue = make_queue(60).await;
    let envelope = Envelope::decode(
        r#"{"id":"fixed","job":"noop","data":{"k":"v"},"max_tries":2,"timeout":null,"attempts":0}"#,
    )
    .unwrap();
    let payload = envelope.encode().unwrap();

    let id = queue.push_raw(&payload, None).await.unwrap();
    assert_eq!(id, "fixed");

    let job = queue.pop(None).await.unwrap().unwrap();
    assert_eq!(job.raw_payload(), payload);
    assert_eq!(job.max_tries(), Some(2));
}
