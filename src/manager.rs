//! Connection registry
//!
//! Owns the connection configuration map and the per-driver connectors,
//! resolves queues lazily, and caches them by connection name. Also home to
//! the convenience producer API and failed-job retry tooling.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::connector::{Connector, NullConnector, QueueContext, SyncConnector};
use crate::control::{InMemorySwitch, MaintenanceSwitch, WORKER_FLAG};
use crate::envelope::{Envelope, JobData};
use crate::error::{QueueError, QueueResult};
use crate::events::EventBus;
use crate::failed::FailedJobProvider;
use crate::handler::HandlerResolver;
use crate::queue::Queue;
use crate::time::Delay;

/// The registry. Cheap to share behind an `Arc`; resolved connections are
/// cached so repeated lookups do not reconnect.
pub struct QueueManager {
    configs: RwLock<HashMap<String, ConnectionConfig>>,
    default_connection: String,
    connectors: RwLock<HashMap<&'static str, Arc<dyn Connector>>>,
    connections: RwLock<HashMap<String, Arc<dyn Queue>>>,
    context: QueueContext,
    switch: Arc<dyn MaintenanceSwitch>,
}

impl QueueManager {
    /// Build a registry around a handler resolver. Connectors for every
    /// enabled driver are pre-registered; `sync` and `null` resolve without
    /// configuration.
    pub fn new(resolver: Arc<dyn HandlerResolver>) -> Self {
        let defaults: Vec<Arc<dyn Connector>> = vec![
            Arc::new(SyncConnector),
            Arc::new(NullConnector),
            #[cfg(feature = "database")]
            Arc::new(crate::connector::DatabaseConnector::new()),
            #[cfg(feature = "redis")]
            Arc::new(crate::connector::RedisConnector),
            #[cfg(feature = "beanstalkd")]
            Arc::new(crate::connector::BeanstalkdConnector),
            #[cfg(feature = "sqs")]
            Arc::new(crate::connector::SqsConnector),
            #[cfg(feature = "amqp")]
            Arc::new(crate::connector::AmqpConnector),
        ];
        let connectors = defaults
            .into_iter()
            .map(|connector| (connector.name(), connector))
            .collect();

        Self {
            configs: RwLock::new(HashMap::new()),
            default_connection: "sync".to_string(),
            connectors: RwLock::new(connectors),
            connections: RwLock::new(HashMap::new()),
            context: QueueContext {
                resolver,
                events: EventBus::default(),
            },
            switch: Arc::new(InMemorySwitch::new()),
        }
    }

    pub fn with_default_connection(mut self, name: impl Into<String>) -> Self {
        self.default_connection = name.into();
        self
    }

    pub fn with_maintenance_switch(mut self, switch: Arc<dyn MaintenanceSwitch>) -> Self {
        self.switch = switch;
        self
    }

    /// Add or replace a named connection.
    pub async fn add_connection(&self, name: impl Into<String>, config: ConnectionConfig) {
        let name = name.into();
        debug!(connection = %name, driver = config.driver(), "connection configured");
        self.configs.write().await.insert(name.clone(), config);
        // A fresh config invalidates any cached instance.
        self.connections.write().await.remove(&name);
    }

    /// Replace or add a connector, e.g. one pre-seeded with a pool.
    pub async fn register_connector(&self, connector: Arc<dyn Connector>) {
        self.connectors
            .write()
            .await
            .insert(connector.name(), connector);
    }

    pub fn events(&self) -> &EventBus {
        &self.context.events
    }

    pub fn resolver(&self) -> Arc<dyn HandlerResolver> {
        self.context.resolver.clone()
    }

    pub fn default_connection(&self) -> &str {
        &self.default_connection
    }

    /// Whether workers should idle instead of polling.
    pub fn is_down_for_maintenance(&self) -> QueueResult<bool> {
        self.switch.is_on(WORKER_FLAG)
    }

    pub fn maintenance_switch(&self) -> Arc<dyn MaintenanceSwitch> {
        self.switch.clone()
    }

    /// Resolve a connection by name, `None` meaning the default.
    pub async fn connection(&self, name: Option<&str>) -> QueueResult<Arc<dyn Queue>> {
        let name = name.unwrap_or(&self.default_connection).to_string();

        if let Some(queue) = self.connections.read().await.get(&name) {
            return Ok(queue.clone());
        }

        let config = match self.configs.read().await.get(&name) {
            Some(config) => config.clone(),
            // The virtual drivers work without configuration.
            None if name == "sync" => ConnectionConfig::Sync,
            None if name == "null" => ConnectionConfig::Null,
            None => return Err(QueueError::UnknownConnection(name)),
        };

        let connector = self
            .connectors
            .read()
            .await
            .get(config.driver())
            .cloned()
            .ok_or_else(|| QueueError::UnknownDriver(config.driver().to_string()))?;

        let queue = connector.connect(&name, &self.context, &config).await?;
        info!(connection = %name, driver = config.driver(), "connection resolved");
        self.connections
            .write()
            .await
            .insert(name.clone(), queue.clone());
        Ok(queue)
    }

    /// Push onto a connection (`None` = default) and queue (`None` = that
    /// connection's default queue).
    pub async fn push(
        &self,
        job: &str,
        data: JobData,
        queue: Option<&str>,
        connection: Option<&str>,
    ) -> QueueResult<String> {
        self.connection(connection).await?.push(job, data, queue).await
    }

    /// Delayed push.
    pub async fn later(
        &self,
        delay: Delay,
        job: &str,
        data: JobData,
        queue: Option<&str>,
        connection: Option<&str>,
    ) -> QueueResult<String> {
        self.connection(connection)
            .await?
            .later(delay, job, data, queue)
            .await
    }

    /// Push several jobs sharing one payload.
    pub async fn bulk(
        &self,
        jobs: &[&str],
        data: JobData,
        queue: Option<&str>,
        connection: Option<&str>,
    ) -> QueueResult<()> {
        self.connection(connection).await?.bulk(jobs, data, queue).await
    }

    /// Approximate queue depth.
    pub async fn size(&self, queue: Option<&str>, connection: Option<&str>) -> QueueResult<u64> {
        self.connection(connection).await?.size(queue).await
    }

    /// Re-enqueue one ledger entry with its attempt count reset, then
    /// forget it. Returns the new job id.
    pub async fn retry_failed(
        &self,
        ledger: &dyn FailedJobProvider,
        id: u64,
    ) -> QueueResult<String> {
        let entry = ledger
            .find(id)
            .await?
            .ok_or_else(|| QueueError::Payload(format!("no failed job with id {id}")))?;

        let mut envelope = Envelope::decode(&entry.payload)?;
        envelope.attempts = 0;
        let payload = envelope.encode()?;

        let job_id = self
            .connection(Some(&entry.connection))
            .await?
            .push_raw(&payload, Some(&entry.queue))
            .await?;
        ledger.forget(id).await?;
        info!(id, job = %envelope.job, "failed job re-enqueued");
        Ok(job_id)
    }

    /// Retry every ledger entry. Returns how many were re-enqueued.
    pub async fn retry_all_failed(&self, ledger: &dyn FailedJobProvider) -> QueueResult<u64> {
        let mut count = 0;
        for entry in ledger.all().await? {
            self.retry_failed(ledger, entry.id).await?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::handler::{HandlerRegistry, JobHandler};
    use crate::job::ReservedJob;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn fire(&self, _job: &dyn ReservedJob, _data: &JobData) -> QueueResult<()> {
            Ok(())
        }
    }

    fn manager() -> QueueManager {
        let registry = HandlerRegistry::new();
        registry.register("noop", Arc::new(Noop));
        QueueManager::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn virtual_connections_need_no_config() {
        let manager = manager();
        let sync = manager.connection(Some("sync")).await.unwrap();
        assert_eq!(sync.connection_name(), "sync");
        let null = manager.connection(Some("null")).await.unwrap();
        assert_eq!(null.connection_name(), "null");
    }

    #[tokio::test]
    async fn unknown_connection_is_an_error() {
        let err = manager().connection(Some("missing")).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownConnection(name) if name == "missing"));
    }

    #[tokio::test]
    async fn connections_are_cached() {
        let manager = manager();
        let a = manager.connection(Some("null")).await.unwrap();
        let b = manager.connection(Some("null")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn default_connection_is_used_when_unnamed() {
        let manager = manager().with_default_connection("null");
        let id = manager.push("noop", json!({}), None, None).await.unwrap();
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn maintenance_flag_round_trips() {
        let manager = manager();
        assert!(!manager.is_down_for_maintenance().unwrap());
        manager.maintenance_switch().turn_on(WORKER_FLAG).unwrap();
        assert!(manager.is_down_for_maintenance().unwrap());
    }
}
