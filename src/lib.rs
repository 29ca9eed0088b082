//! # conveyor
//!
//! Multi-backend job queue client and worker runtime.
//!
//! Producers enqueue serialized job envelopes onto one of several pluggable
//! backends; a worker daemon reserves jobs, executes them through registered
//! handlers, and applies retry and failure policy. Delivery is at-least-once
//! on every backend, so handlers should be idempotent.
//!
//! ## Backends
//!
//! - **sync** - executes inline at enqueue time (always available)
//! - **null** - discards everything (always available)
//! - **database** - any sqlx-supported SQL database (feature `database`, on
//!   by default)
//! - **redis** - list plus delayed/reserved sorted sets (feature `redis`)
//! - **beanstalkd** - beanstalkd tubes (feature `beanstalkd`)
//! - **sqs** - AWS SQS (feature `sqs`)
//! - **amqp** - AMQP 0.9.1 brokers (feature `amqp`)
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use conveyor::prelude::*;
//! use serde_json::json;
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl JobHandler for SendEmail {
//!     async fn fire(&self, _job: &dyn ReservedJob, data: &JobData) -> QueueResult<()> {
//!         println!("sending to {}", data["to"]);
//!         Ok(())
//!     }
//!
//!     fn max_tries(&self) -> Option<u32> {
//!         Some(3)
//!     }
//! }
//!
//! # async fn run() -> QueueResult<()> {
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.register("send_email", Arc::new(SendEmail));
//!
//! let manager = Arc::new(QueueManager::new(registry));
//! manager
//!     .add_connection(
//!         "database",
//!         ConnectionConfig::Database(DatabaseConfig::new("sqlite:queue.db")),
//!     )
//!     .await;
//!
//! manager
//!     .push("send_email", json!({"to": "user@example.com"}), None, Some("database"))
//!     .await?;
//!
//! let worker = Worker::new(
//!     manager.clone(),
//!     Arc::new(InMemoryFailedJobProvider::new()),
//!     Arc::new(InMemoryRestartStore::new()),
//! );
//! let options = WorkerOptions::default().with_sleep(Duration::from_secs(1));
//! worker.daemon(Some("database"), "default", &options).await;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod connector;
pub mod control;
pub mod envelope;
pub mod error;
pub mod events;
pub mod failed;
pub mod handler;
pub mod job;
pub mod manager;
pub mod null;
pub mod queue;
pub mod sync;
pub mod time;
pub mod worker;

#[cfg(feature = "amqp")]
#[cfg_attr(docsrs, doc(cfg(feature = "amqp")))]
pub mod amqp;

#[cfg(feature = "beanstalkd")]
#[cfg_attr(docsrs, doc(cfg(feature = "beanstalkd")))]
pub mod beanstalkd;

#[cfg(feature = "database")]
#[cfg_attr(docsrs, doc(cfg(feature = "database")))]
pub mod database;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

#[cfg(feature = "sqs")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqs")))]
pub mod sqs;

pub use config::ConnectionConfig;
pub use connector::{Connector, QueueContext};
pub use control::{
    InMemoryRestartStore, InMemorySwitch, MaintenanceSwitch, RESTART_KEY, RestartStore,
    WORKER_FLAG,
};
pub use envelope::{Envelope, JobData};
pub use error::{QueueError, QueueResult};
pub use events::{EventBus, ExitStatus, QueueEvent};
pub use failed::{FailedJob, FailedJobProvider, InMemoryFailedJobProvider};
pub use handler::{HandlerRegistry, HandlerResolver, JobHandler};
pub use job::{JobState, ReservedJob};
pub use manager::QueueManager;
pub use queue::Queue;
pub use time::Delay;
pub use worker::{Worker, WorkerOptions, WorkerSignals};

#[cfg(feature = "database")]
pub use config::DatabaseConfig;
#[cfg(feature = "database")]
pub use failed::DatabaseFailedJobProvider;

#[cfg(feature = "redis")]
pub use config::RedisConfig;

#[cfg(feature = "beanstalkd")]
pub use config::BeanstalkdConfig;

#[cfg(feature = "sqs")]
pub use config::SqsConfig;

#[cfg(feature = "amqp")]
pub use config::AmqpConfig;

/// Common imports for applications using the crate.
pub mod prelude {
    pub use crate::config::ConnectionConfig;
    pub use crate::control::{InMemoryRestartStore, InMemorySwitch};
    pub use crate::envelope::{Envelope, JobData};
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::events::{EventBus, ExitStatus, QueueEvent};
    pub use crate::failed::{FailedJobProvider, InMemoryFailedJobProvider};
    pub use crate::handler::{HandlerRegistry, JobHandler};
    pub use crate::job::ReservedJob;
    pub use crate::manager::QueueManager;
    pub use crate::queue::Queue;
    pub use crate::time::Delay;
    pub use crate::worker::{Worker, WorkerOptions};

    #[cfg(feature = "database")]
    pub use crate::config::DatabaseConfig;
    #[cfg(feature = "redis")]
    pub use crate::config::RedisConfig;
    #[cfg(feature = "beanstalkd")]
    pub use crate::config::BeanstalkdConfig;
    #[cfg(feature = "sqs")]
    pub use crate::config::SqsConfig;
    #[cfg(feature = "amqp")]
    pub use crate::config::AmqpConfig;
}
