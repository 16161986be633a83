//! In-memory collaborators for driving the orchestrator and sessions without a
//! network, a database or a bus.

use crate::{
    config::SessionSettings,
    orchestrator::{Orchestrator, OrchestratorHandle},
    state::BridgeState,
    ws::{Connector, SessionState, WsSink, WsStream},
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use chatbridge_core::{
    directory::{Credentials, Directory},
    identity::{AccessGrant, IdentityProvider},
    protocol::{ClientIdentity, KEEPALIVE},
    publisher::EventPublisher,
    upload::{MediaTransfer, UploadForm, UploadTicket},
};
use chrono::{DateTime, Utc};
use futures::{FutureExt, SinkExt, StreamExt, channel::mpsc as wire};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

pub const CHAT_HOST: &str = "chat.test";
pub const LOGIN_TOKEN: &str = "tok-login";
pub const UPLOAD_LOCATION: &str = "https://files.test/media/1";

#[derive(Default)]
pub struct FakeDirectory {
    pub online: Mutex<Vec<(String, bool)>>,
    pub last_seen: AtomicUsize,
}

impl FakeDirectory {
    pub fn online_calls(&self) -> Vec<(String, bool)> {
        self.online.lock().unwrap().clone()
    }
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn credentials(&self, agent_id: &str) -> Result<Credentials> {
        if agent_id.starts_with("unknown") {
            return Err(anyhow!("no credentials for {agent_id}"));
        }
        Ok(Credentials {
            login: format!("{agent_id}@example.com"),
            password: SecretString::from("pw"),
        })
    }

    async fn set_online(&self, agent_id: &str, online: bool) -> Result<()> {
        self.online
            .lock()
            .unwrap()
            .push((agent_id.to_string(), online));
        Ok(())
    }

    async fn set_last_seen(&self, _agent_id: &str, _at: DateTime<Utc>) -> Result<()> {
        self.last_seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn mark_all_offline(&self) -> Result<()> {
        self.online.lock().unwrap().clear();
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeIdentity {
    pub logins: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub fail_login: AtomicBool,
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn login(&self, _credentials: &Credentials) -> Result<AccessGrant> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if self.fail_login.load(Ordering::SeqCst) {
            return Err(anyhow!("invalid credentials"));
        }
        Ok(AccessGrant {
            access_token: SecretString::from(LOGIN_TOKEN),
            chat_server_host: CHAT_HOST.to_string(),
        })
    }

    async fn refresh(&self, _access_token: &SecretString) -> Result<AccessGrant> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(AccessGrant {
            access_token: SecretString::from(format!("tok-refresh-{n}")),
            chat_server_host: CHAT_HOST.to_string(),
        })
    }
}

#[derive(Default)]
pub struct FakeMedia {
    pub fail_ticket: AtomicBool,
    /// Token and extension of every ticket request.
    pub tickets: Mutex<Vec<(String, String)>>,
    pub uploads: AtomicUsize,
}

#[async_trait]
impl MediaTransfer for FakeMedia {
    async fn request_ticket(&self, access_token: &SecretString, extension: &str) -> Result<UploadTicket> {
        self.tickets
            .lock()
            .unwrap()
            .push((access_token.expose_secret().to_string(), extension.to_string()));
        if self.fail_ticket.load(Ordering::SeqCst) {
            return Err(anyhow!("ticket endpoint answered not ok"));
        }
        Ok(UploadTicket {
            url: "https://storage.test/bucket".to_string(),
            date: "20240101T000000Z".to_string(),
            policy: "policy".to_string(),
            credential: "credential".to_string(),
            algorithm: "AWS4-HMAC-SHA256".to_string(),
            signature: "signature".to_string(),
            key: "media/1".to_string(),
        })
    }

    async fn upload(&self, _form: UploadForm) -> Result<Option<String>> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(Some(UPLOAD_LOCATION.to_string()))
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<Bytes>>,
}

impl RecordingPublisher {
    pub fn payloads(&self) -> Vec<Bytes> {
        self.published.lock().unwrap().clone()
    }

    pub fn frames(&self) -> Vec<Value> {
        self.payloads()
            .iter()
            .map(|payload| serde_json::from_slice(payload).unwrap())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, payload: Bytes) -> Result<()> {
        self.published.lock().unwrap().push(payload);
        Ok(())
    }
}

/// The chat server's side of one in-memory socket.
pub struct FakePeer {
    pub written: wire::UnboundedReceiver<Message>,
    pub inbound: wire::UnboundedSender<Result<Message, WsError>>,
}

impl FakePeer {
    pub fn send_text(&self, text: &str) {
        self.inbound
            .unbounded_send(Ok(Message::Text(text.to_string().into())))
            .unwrap();
    }

    pub fn send_error(&self, error: WsError) {
        self.inbound.unbounded_send(Err(error)).unwrap();
    }

    /// Next frame written by the bridge, keepalives excluded.
    pub async fn next_frame(&mut self) -> Message {
        loop {
            let message = self.written.next().await.expect("socket sink dropped");
            if !is_keepalive(&message) {
                return message;
            }
        }
    }

    pub async fn next_json(&mut self) -> Value {
        match self.next_frame().await {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// Frames already written and not yet read, keepalives excluded.
    pub fn pending_frames(&mut self) -> Vec<Message> {
        let mut frames = Vec::new();
        while let Some(Some(message)) = self.written.next().now_or_never() {
            if !is_keepalive(&message) {
                frames.push(message);
            }
        }
        frames
    }
}

fn is_keepalive(message: &Message) -> bool {
    matches!(message, Message::Text(text) if text.as_str() == KEEPALIVE)
}

pub struct FakeConnector {
    peers: mpsc::UnboundedSender<FakePeer>,
    pub hosts: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl FakeConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FakePeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Self {
            peers,
            hosts: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        };
        (connector, rx)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, host: &str) -> Result<(WsSink, WsStream)> {
        self.hosts.lock().unwrap().push(host.to_string());
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        let (written_tx, written) = wire::unbounded();
        let (inbound, inbound_rx) = wire::unbounded();
        self.peers
            .send(FakePeer { written, inbound })
            .map_err(|_| anyhow!("test dropped the peer receiver"))?;
        let sink = written_tx.sink_map_err(|_| WsError::ConnectionClosed);
        Ok((Box::pin(sink), Box::pin(inbound_rx)))
    }
}

/// Settings with the default delays and the pong watchdog off.
pub fn quiet_settings() -> SessionSettings {
    SessionSettings {
        max_missed_pongs: 0,
        ..SessionSettings::default()
    }
}

/// A running orchestrator wired to fakes.
pub struct Harness {
    pub handle: OrchestratorHandle,
    pub directory: Arc<FakeDirectory>,
    pub identity: Arc<FakeIdentity>,
    pub media: Arc<FakeMedia>,
    pub publisher: Arc<RecordingPublisher>,
    pub connector: Arc<FakeConnector>,
    pub peers: mpsc::UnboundedReceiver<FakePeer>,
}

impl Harness {
    pub fn start(settings: SessionSettings) -> Self {
        let directory = Arc::new(FakeDirectory::default());
        let identity = Arc::new(FakeIdentity::default());
        let media = Arc::new(FakeMedia::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let (connector, peers) = FakeConnector::new();
        let connector = Arc::new(connector);

        let state = Arc::new(BridgeState {
            directory: directory.clone(),
            identity: identity.clone(),
            media: media.clone(),
            publisher: publisher.clone(),
            connector: connector.clone(),
            settings: Arc::new(settings),
            client_identity: ClientIdentity::default(),
        });
        let (orchestrator, handle) = Orchestrator::new(state);
        tokio::spawn(orchestrator.run());

        Self {
            handle,
            directory,
            identity,
            media,
            publisher,
            connector,
            peers,
        }
    }

    /// Brings `agent_id` online, consumes the subscribe and auth frames and waits
    /// for the session to become active.
    pub async fn online(&mut self, agent_id: &str) -> FakePeer {
        self.handle
            .lifecycle(chatbridge_core::LifecycleEvent {
                agent_id: agent_id.to_string(),
                is_online: true,
            })
            .await
            .unwrap();
        self.handle.registered().await.unwrap();
        let mut peer = self.peers.recv().await.expect("no socket was opened");
        let subscribe = peer.next_json().await;
        assert_eq!(subscribe["method"], "subscribe");
        let auth = peer.next_json().await;
        assert_eq!(auth["params"]["name"], "login");
        self.wait_state(agent_id, SessionState::Active).await;
        peer
    }

    pub async fn offline(&self, agent_id: &str) {
        self.handle
            .lifecycle(chatbridge_core::LifecycleEvent {
                agent_id: agent_id.to_string(),
                is_online: false,
            })
            .await
            .unwrap();
    }

    pub async fn command(&self, agent_id: &str, name: &str, payload: Value) {
        self.handle
            .command(chatbridge_core::CommandEnvelope {
                agent_id: agent_id.to_string(),
                command_name: name.to_string(),
                command_payload: payload,
            })
            .await
            .unwrap();
    }

    pub async fn registered_agents(&self) -> Vec<String> {
        self.handle
            .registered()
            .await
            .unwrap()
            .into_iter()
            .map(|(agent_id, _)| agent_id)
            .collect()
    }

    pub async fn session_state(&self, agent_id: &str) -> Option<SessionState> {
        self.handle
            .registered()
            .await
            .unwrap()
            .into_iter()
            .find_map(|(agent, state)| (agent == agent_id).then_some(state))
    }

    /// Polls the registry until the session of `agent_id` is in `state`.
    pub async fn wait_state(&self, agent_id: &str, state: SessionState) {
        for _ in 0..100 {
            if self.session_state(agent_id).await == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{agent_id} never reached {state:?}");
    }

    /// Polls the registry until `agent_id` is gone.
    pub async fn wait_released(&self, agent_id: &str) {
        for _ in 0..2_000 {
            if !self.registered_agents().await.iter().any(|a| a == agent_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{agent_id} was never released");
    }
}
