//! Driver connectors
//!
//! A connector turns one [`ConnectionConfig`] variant into a live
//! [`Queue`]. The registry owns one connector per driver name and calls it
//! lazily the first time a connection is requested.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::error::{QueueError, QueueResult};
use crate::events::EventBus;
use crate::handler::HandlerResolver;
use crate::null::NullQueue;
use crate::queue::Queue;
use crate::sync::SyncQueue;

/// Shared collaborators every backend needs.
#[derive(Clone)]
pub struct QueueContext {
    /// Handler lookup used to stamp limits into envelopes at enqueue time
    pub resolver: Arc<dyn HandlerResolver>,
    /// Lifecycle event fan-out
    pub events: EventBus,
}

/// Builds a queue for one driver.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Driver tag this connector claims, matching [`ConnectionConfig::driver`].
    fn name(&self) -> &'static str;

    /// Open a queue named `connection` from `config`.
    async fn connect(
        &self,
        connection: &str,
        context: &QueueContext,
        config: &ConnectionConfig,
    ) -> QueueResult<Arc<dyn Queue>>;
}

fn mismatch(connector: &str, config: &ConnectionConfig) -> QueueError {
    QueueError::Config(format!(
        "{connector} connector handed a '{}' config",
        config.driver()
    ))
}

/// Connector for the inline-execution driver.
pub struct SyncConnector;

#[async_trait]
impl Connector for SyncConnector {
    fn name(&self) -> &'static str {
        "sync"
    }

    async fn connect(
        &self,
        connection: &str,
        context: &QueueContext,
        config: &ConnectionConfig,
    ) -> QueueResult<Arc<dyn Queue>> {
        match config {
            ConnectionConfig::Sync => Ok(Arc::new(SyncQueue::new(
                connection,
                context.resolver.clone(),
                context.events.clone(),
            ))),
            other => Err(mismatch("sync", other)),
        }
    }
}

/// Connector for the discard driver.
pub struct NullConnector;

#[async_trait]
impl Connector for NullConnector {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn connect(
        &self,
        connection: &str,
        context: &QueueContext,
        config: &ConnectionConfig,
    ) -> QueueResult<Arc<dyn Queue>> {
        match config {
            ConnectionConfig::Null => Ok(Arc::new(NullQueue::new(
                connection,
                context.resolver.clone(),
            ))),
            other => Err(mismatch("null", other)),
        }
    }
}

/// Connector for the relational-database driver.
#[cfg(feature = "database")]
#[derive(Default)]
pub struct DatabaseConnector {
    /// Pre-built pool, mostly for tests; a fresh pool is opened otherwise.
    pool: Option<sqlx::AnyPool>,
}

#[cfg(feature = "database")]
impl DatabaseConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(pool: sqlx::AnyPool) -> Self {
        Self { pool: Some(pool) }
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl Connector for DatabaseConnector {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn connect(
        &self,
        connection: &str,
        context: &QueueContext,
        config: &ConnectionConfig,
    ) -> QueueResult<Arc<dyn Queue>> {
        match config {
            ConnectionConfig::Database(db) => {
                let queue = match &self.pool {
                    Some(pool) => crate::database::DatabaseQueue::new(
                        connection,
                        db.clone(),
                        pool.clone(),
                        context.resolver.clone(),
                    )?,
                    None => {
                        crate::database::connect(connection, db, context.resolver.clone()).await?
                    }
                };
                Ok(Arc::new(queue))
            }
            other => Err(mismatch("database", other)),
        }
    }
}

/// Connector for the Redis driver.
#[cfg(feature = "redis")]
pub struct RedisConnector;

#[cfg(feature = "redis")]
#[async_trait]
impl Connector for RedisConnector {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(
        &self,
        connection: &str,
        context: &QueueContext,
        config: &ConnectionConfig,
    ) -> QueueResult<Arc<dyn Queue>> {
        match config {
            ConnectionConfig::Redis(redis) => Ok(Arc::new(
                crate::redis::connect(connection, redis, context.resolver.clone()).await?,
            )),
            other => Err(mismatch("redis", other)),
        }
    }
}

/// Connector for the Beanstalk driver.
#[cfg(feature = "beanstalkd")]
pub struct BeanstalkdConnector;

#[cfg(feature = "beanstalkd")]
#[async_trait]
impl Connector for BeanstalkdConnector {
    fn name(&self) -> &'static str {
        "beanstalkd"
    }

    async fn connect(
        &self,
        connection: &str,
        context: &QueueContext,
        config: &ConnectionConfig,
    ) -> QueueResult<Arc<dyn Queue>> {
        match config {
            ConnectionConfig::Beanstalkd(beanstalkd) => Ok(Arc::new(
                crate::beanstalkd::connect(connection, beanstalkd, context.resolver.clone())
                    .await?,
            )),
            other => Err(mismatch("beanstalkd", other)),
        }
    }
}

/// Connector for the SQS driver.
#[cfg(feature = "sqs")]
pub struct SqsConnector;

#[cfg(feature = "sqs")]
#[async_trait]
impl Connector for SqsConnector {
    fn name(&self) -> &'static str {
        "sqs"
    }

    async fn connect(
        &self,
        connection: &str,
        context: &QueueContext,
        config: &ConnectionConfig,
    ) -> QueueResult<Arc<dyn Queue>> {
        match config {
            ConnectionConfig::Sqs(sqs) => Ok(Arc::new(
                crate::sqs::connect(connection, sqs, context.resolver.clone()).await?,
            )),
            other => Err(mismatch("sqs", other)),
        }
    }
}

/// Connector for the AMQP driver.
#[cfg(feature = "amqp")]
pub struct AmqpConnector;

#[cfg(feature = "amqp")]
#[async_trait]
impl Connector for AmqpConnector {
    fn name(&self) -> &'static str {
        "amqp"
    }

    async fn connect(
        &self,
        connection: &str,
        context: &QueueContext,
        config: &ConnectionConfig,
    ) -> QueueResult<Arc<dyn Queue>> {
        match config {
            ConnectionConfig::Amqp(amqp) => Ok(Arc::new(
                crate::amqp::connect(connection, amqp, context.resolver.clone()).await?,
            )),
            other => Err(mismatch("amqp", other)),
        }
    }
}
