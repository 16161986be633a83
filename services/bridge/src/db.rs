//! Directory Store
//!
//! MySQL-backed implementation of the agent directory: vendor credentials and the
//! online/last-seen status the bridge reports back. Queries are checked at runtime
//! because the schema belongs to the ERP side, not to this service.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chatbridge_core::directory::{Credentials, Directory};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use sqlx::MySqlPool;

// `chat_jivosite_manager` is the ERP's agent table, keyed by `manager_id`.
const SELECT_CREDENTIALS: &str =
    "SELECT login, password FROM chat_jivosite_manager WHERE manager_id = ?";
const UPDATE_ONLINE: &str = "UPDATE chat_jivosite_manager SET is_online = ? WHERE manager_id = ?";
const UPDATE_LAST_SEEN: &str =
    "UPDATE chat_jivosite_manager SET last_seen = ? WHERE manager_id = ?";
const UPDATE_ALL_OFFLINE: &str = "UPDATE chat_jivosite_manager SET is_online = FALSE";

/// A wrapper around the `MySqlPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: MySqlPool,
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Directory for Db {
    async fn credentials(&self, agent_id: &str) -> Result<Credentials> {
        let (login, password): (String, String) = sqlx::query_as(SELECT_CREDENTIALS)
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?
            .with_context(|| format!("no credentials stored for agent {agent_id}"))?;

        Ok(Credentials {
            login,
            password: SecretString::from(password),
        })
    }

    async fn set_online(&self, agent_id: &str, online: bool) -> Result<()> {
        sqlx::query(UPDATE_ONLINE)
            .bind(online)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_last_seen(&self, agent_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(UPDATE_LAST_SEEN)
            .bind(at)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_all_offline(&self) -> Result<()> {
        sqlx::query(UPDATE_ALL_OFFLINE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
