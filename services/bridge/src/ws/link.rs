//! Serialized socket writes.
//!
//! Every protocol write of a session goes through one [`SessionLink`]. The
//! request-sequence counter lives behind the same lock as the socket sink, so
//! sequence values are handed out in write order and never reused.

use super::connector::WsSink;
use chatbridge_core::protocol::{CorrelationReply, KEEPALIVE, Request};
use futures_util::SinkExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{
    Error as WsError, Message,
    protocol::{CloseFrame, frame::coding::CloseCode},
};

#[derive(Debug, thiserror::Error)]
pub(crate) enum LinkError {
    #[error("socket write failed: {0}")]
    Transport(#[from] WsError),
    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A request that reached the socket.
#[derive(Debug)]
pub(crate) struct Sent {
    pub seq: u64,
    pub frame: String,
}

struct LinkInner {
    sink: WsSink,
    requests: u64,
}

impl LinkInner {
    fn next_seq(&mut self) -> u64 {
        self.requests += 1;
        self.requests
    }
}

pub(crate) struct SessionLink {
    inner: Mutex<LinkInner>,
}

impl SessionLink {
    pub fn new(sink: WsSink) -> Self {
        Self {
            inner: Mutex::new(LinkInner { sink, requests: 0 }),
        }
    }

    /// Stamps `params` with the next sequence value and writes the request.
    pub async fn request<P: Serialize>(
        &self,
        method: &'static str,
        params: P,
    ) -> Result<Sent, LinkError> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq();
        let frame = serde_json::to_string(&Request::new(seq, method, params))?;
        inner.sink.send(Message::Text(frame.clone().into())).await?;
        Ok(Sent { seq, frame })
    }

    /// Acknowledges inbound frame `id`. Consumes a sequence value like any request.
    pub async fn reply(&self, id: i64) -> Result<u64, LinkError> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq();
        let frame = serde_json::to_string(&CorrelationReply::new(id))?;
        inner.sink.send(Message::Text(frame.into())).await?;
        Ok(seq)
    }

    pub async fn keepalive(&self) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().await;
        inner
            .sink
            .send(Message::Text(KEEPALIVE.to_string().into()))
            .await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().await;
        inner
            .sink
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: String::new().into(),
            })))
            .await?;
        Ok(())
    }
}
