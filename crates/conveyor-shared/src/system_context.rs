//! Process-wide wiring, constructed once at startup and passed to every
//! component as `Arc<SystemContext>`. There are no global registries; the
//! context object is the replacement.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::{ConfigManager, ConveyorConfig};
use crate::errors::ConveyorResult;
use crate::events::EventPublisher;
use crate::messaging::{InMemoryProvider, MessageClient, MessagingProvider, PgmqProvider};

#[derive(Debug)]
pub struct SystemContext {
    config: Arc<ConveyorConfig>,
    pool: PgPool,
    message_client: MessageClient,
    event_publisher: EventPublisher,
    processor_id: Uuid,
}

impl SystemContext {
    /// Load configuration from the environment and connect.
    pub async fn new() -> ConveyorResult<Self> {
        let config = ConfigManager::load()?.into_config();
        Self::from_config(config).await
    }

    /// Connect a PGMQ-backed context from explicit configuration.
    pub async fn from_config(config: ConveyorConfig) -> ConveyorResult<Self> {
        let url = config.database.resolved_url()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_seconds))
            .connect(&url)
            .await?;

        let provider = MessagingProvider::Pgmq(PgmqProvider::new(pool.clone()).await);
        Ok(Self::assemble(config, pool, provider))
    }

    /// Context over an existing pool with in-memory messaging; the standard
    /// entry point for integration tests.
    pub async fn with_pool(pool: PgPool) -> ConveyorResult<Self> {
        Self::with_pool_and_config(pool, ConveyorConfig::default()).await
    }

    /// Context over an existing pool and explicit configuration, with
    /// in-memory messaging.
    pub async fn with_pool_and_config(
        pool: PgPool,
        config: ConveyorConfig,
    ) -> ConveyorResult<Self> {
        let provider = MessagingProvider::InMemory(InMemoryProvider::new());
        Ok(Self::assemble(config, pool, provider))
    }

    fn assemble(config: ConveyorConfig, pool: PgPool, provider: MessagingProvider) -> Self {
        let config = Arc::new(config);
        let message_client = MessageClient::new(
            Arc::new(provider),
            Arc::new(config.queue.clone()),
        );
        Self {
            config,
            pool,
            message_client,
            event_publisher: EventPublisher::new(),
            processor_id: Uuid::now_v7(),
        }
    }

    pub fn config(&self) -> &ConveyorConfig {
        &self.config
    }

    pub fn database_pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn message_client(&self) -> &MessageClient {
        &self.message_client
    }

    pub fn event_publisher(&self) -> &EventPublisher {
        &self.event_publisher
    }

    pub fn processor_id(&self) -> Uuid {
        self.processor_id
    }
}
