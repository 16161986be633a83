//! Vendor identity provider contract.

use crate::directory::Credentials;
use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;

/// A successful login or refresh.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub access_token: SecretString,
    /// Host of the chat socket the agent must connect to.
    pub chat_server_host: String,
}

/// Obtains and refreshes agent access tokens.
///
/// Called once when a session is activated and again before every media upload.
/// Implementations must not retry internally; a failed login must never be
/// repeated behind the caller's back.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<AccessGrant>;

    async fn refresh(&self, access_token: &SecretString) -> Result<AccessGrant>;
}
