//! Outbound bus contract.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Publishes vendor events and delivered media messages to the outbound topic.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, payload: Bytes) -> Result<()>;
}
