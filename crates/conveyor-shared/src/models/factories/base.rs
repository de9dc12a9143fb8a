//! Factory contract for building persisted fixtures in tests.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::errors::ConveyorResult;

#[async_trait]
pub trait SqlxFactory<T> {
    /// Persist the configured fixture and return the created entity.
    async fn create(&self, pool: &PgPool) -> ConveyorResult<T>;
}
