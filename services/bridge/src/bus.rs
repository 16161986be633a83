//! Message Bus
//!
//! NATS connection used in both directions: the lifecycle and command subjects
//! feed the orchestrator, and the outbound subject receives vendor events and
//! delivered media messages.

use crate::orchestrator::OrchestratorHandle;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chatbridge_core::{
    command::{CommandEnvelope, LifecycleEvent},
    publisher::EventPublisher,
};
use futures::{Stream, StreamExt};
use std::pin::pin;
use tracing::{debug, info, warn};

pub struct NatsBus {
    client: async_nats::Client,
    outbound: String,
}

impl NatsBus {
    pub async fn connect(url: &str, outbound: String) -> Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .name("chatbridge")
            .connect(url)
            .await
            .with_context(|| format!("Failed to connect to NATS at {url}"))?;
        info!(%url, "Connected to NATS");
        Ok(Self { client, outbound })
    }

    /// Payloads published on `subject`.
    pub async fn payloads(&self, subject: &str) -> Result<impl Stream<Item = Bytes> + use<>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .with_context(|| format!("Failed to subscribe to {subject}"))?;
        info!(%subject, "Subscribed to bus subject");
        Ok(subscriber.map(|message| message.payload))
    }
}

#[async_trait]
impl EventPublisher for NatsBus {
    async fn publish(&self, payload: Bytes) -> Result<()> {
        self.client
            .publish(self.outbound.clone(), payload)
            .await
            .with_context(|| format!("Failed to publish to {}", self.outbound))
    }
}

/// Feeds lifecycle events to the orchestrator until the stream or the
/// orchestrator goes away. Undecodable payloads are skipped.
pub async fn pump_lifecycle<S>(payloads: S, orchestrator: OrchestratorHandle)
where
    S: Stream<Item = Bytes>,
{
    let mut payloads = pin!(payloads);
    while let Some(payload) = payloads.next().await {
        let event: LifecycleEvent = match serde_json::from_slice(&payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Can't decode lifecycle event");
                continue;
            }
        };
        debug!(agent_id = %event.agent_id, is_online = event.is_online, "Lifecycle event received");
        if orchestrator.lifecycle(event).await.is_err() {
            break;
        }
    }
    info!("Lifecycle subscription finished");
}

/// Feeds command envelopes to the orchestrator. Undecodable payloads are skipped.
pub async fn pump_commands<S>(payloads: S, orchestrator: OrchestratorHandle)
where
    S: Stream<Item = Bytes>,
{
    let mut payloads = pin!(payloads);
    while let Some(payload) = payloads.next().await {
        let envelope: CommandEnvelope = match serde_json::from_slice(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Can't decode command envelope");
                continue;
            }
        };
        if orchestrator.command(envelope).await.is_err() {
            break;
        }
    }
    info!("Command subscription finished");
}
