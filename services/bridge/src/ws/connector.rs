//! Opens the vendor chat websocket.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{Sink, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, client::IntoClientRequest},
};
use tracing::info;

use crate::vendor::BROWSER_USER_AGENT;

/// Write half of a chat socket.
pub type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
/// Read half of a chat socket.
pub type WsStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Establishes the socket for a session. Separated from the session so the state
/// machine can run against an in-memory peer.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str) -> Result<(WsSink, WsStream)>;
}

/// Connects over TLS to `wss://<host><path>`.
pub struct TungsteniteConnector {
    path: String,
}

impl TungsteniteConnector {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, host: &str) -> Result<(WsSink, WsStream)> {
        let url = format!("wss://{}{}", host, self.path);
        let mut request = url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert("User-Agent", BROWSER_USER_AGENT.parse()?);

        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("Failed to connect to chat socket {url}"))?;
        info!(%url, "Connected to chat socket.");

        let (sink, stream) = ws_stream.split();
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
