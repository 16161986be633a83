//! Credential and status store contract.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

/// Vendor login for one agent.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub login: String,
    pub password: SecretString,
}

/// The external directory of agents: where credentials live and where the bridge
/// records who is online.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn credentials(&self, agent_id: &str) -> Result<Credentials>;

    async fn set_online(&self, agent_id: &str, online: bool) -> Result<()>;

    async fn set_last_seen(&self, agent_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Resets every agent to offline. Called once at process start.
    async fn mark_all_offline(&self) -> Result<()>;
}
