//! Manages the chat socket lifecycle for one agent session.
//!
//! Activation only connects the socket and spawns the session's tasks, so the
//! caller never waits out the handshake delays. The handshake task then walks
//! subscribe, authenticate and, once the session is `Active`, the canned phrases
//! request. The command task holds queued commands until the session is `Active`.
//! Any fatal condition, a failed handshake included, moves the session to
//! `Draining` and is reported once to the orchestrator, which owns the release.

use super::{
    commands::command_loop,
    keepalive::keepalive_loop,
    link::{LinkError, SessionLink},
    reader::read_loop,
};
use crate::state::BridgeState;
use anyhow::{Context, Result, anyhow};
use chatbridge_core::{
    command::OutboundCommand,
    identity::AccessGrant,
    protocol::{AuthParams, CannedPhrasesParams, METHOD_COMETAN, METHOD_SUBSCRIBE, SubscribeParams},
};
use secrecy::ExposeSecret;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};
use uuid::Uuid;

const COMMAND_QUEUE: usize = 256;

/// Lifecycle of one session. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Subscribing,
    Authenticating,
    Active,
    Draining,
    Closed,
}

/// Why a session stopped on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The vendor logged the agent in elsewhere.
    ForcedLogout,
    PeerClosed,
    /// Subscribe or authenticate could not be written.
    HandshakeFailed(String),
    ReadFailed(String),
    WriteFailed(String),
    /// No pong within the watchdog window.
    PeerSilent,
}

/// Sent to the orchestrator when a session ends without being asked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnded {
    pub agent_id: String,
    pub session_id: Uuid,
    pub reason: EndReason,
}

/// State shared by the tasks of one session.
pub(crate) struct SessionShared {
    pub agent_id: String,
    pub session_id: Uuid,
    pub bridge: Arc<BridgeState>,
    pub link: SessionLink,
    pub cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    started: Instant,
    last_pong_ms: AtomicU64,
    reported: AtomicBool,
    ended: mpsc::UnboundedSender<SessionEnded>,
}

impl SessionShared {
    pub fn advance(&self, next: SessionState) -> bool {
        let moved = self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(state = ?next, "Session state changed");
        }
        moved
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn record_pong(&self) {
        self.last_pong_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn since_last_pong(&self) -> Duration {
        let last = Duration::from_millis(self.last_pong_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Broadcasts the quit signal to every task of the session.
    fn quit(&self) {
        self.advance(SessionState::Draining);
        self.cancel.cancel();
    }

    /// Stops the session and reports it to the orchestrator. Only the first call
    /// has any effect, and none at all once a release is under way.
    pub fn end(&self, reason: EndReason) {
        if self.cancel.is_cancelled() || self.reported.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(?reason, "Session ended");
        self.quit();
        let ended = SessionEnded {
            agent_id: self.agent_id.clone(),
            session_id: self.session_id,
            reason,
        };
        if self.ended.send(ended).is_err() {
            debug!("Orchestrator is gone; session end not reported");
        }
    }

    /// Handles a failed write. Transport failures are fatal.
    pub fn write_failed(&self, err: LinkError) {
        match err {
            LinkError::Transport(e) => {
                error!(error = %e, "Socket write failed");
                self.end(EndReason::WriteFailed(e.to_string()));
            }
            LinkError::Encode(e) => error!(error = %e, "Failed to encode frame"),
        }
    }

    /// Waits for the handshake to finish. False if the session stopped first.
    pub async fn authenticated(&self) -> bool {
        let mut state = self.state.subscribe();
        tokio::select! {
            _ = state.wait_for(|s| *s >= SessionState::Active) => {}
            _ = self.cancel.cancelled() => return false,
        }
        self.state() == SessionState::Active
    }

    /// Sleeps for `delay` unless the session quits first.
    pub async fn pause(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(anyhow!("session stopped")),
        }
    }
}

/// The registry's view of a live session.
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    commands: mpsc::Sender<OutboundCommand>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> Uuid {
        self.shared.session_id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Queues a command for the session's command task without waiting.
    pub fn dispatch(&self, command: OutboundCommand) -> Result<()> {
        self.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(command) => {
                anyhow!("command queue is full, dropping {}", command.name())
            }
            TrySendError::Closed(command) => {
                anyhow!("session no longer takes commands, dropping {}", command.name())
            }
        })
    }

    /// Quits every task, waits for them and marks the session `Closed`.
    pub async fn close(self) {
        self.shared.reported.store(true, Ordering::SeqCst);
        self.shared.quit();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(
                    agent_id = %self.shared.agent_id,
                    error = %e,
                    "Session task did not finish cleanly"
                );
            }
        }
        self.shared.advance(SessionState::Closed);
        info!(
            agent_id = %self.shared.agent_id,
            session_id = %self.shared.session_id,
            "Session closed"
        );
    }
}

/// Opens the chat socket for `agent_id` and starts the session's tasks.
///
/// Only a failed connect is returned as an error. The handshake runs on its own
/// task and reports a failure through `ended` like any other session end.
pub async fn activate(
    bridge: Arc<BridgeState>,
    agent_id: &str,
    grant: AccessGrant,
    ended: mpsc::UnboundedSender<SessionEnded>,
) -> Result<SessionHandle> {
    let session_id = Uuid::new_v4();
    let span = info_span!("session", %agent_id, %session_id);
    spawn_session(bridge, agent_id, session_id, grant, ended, span.clone())
        .instrument(span)
        .await
}

async fn spawn_session(
    bridge: Arc<BridgeState>,
    agent_id: &str,
    session_id: Uuid,
    grant: AccessGrant,
    ended: mpsc::UnboundedSender<SessionEnded>,
    span: Span,
) -> Result<SessionHandle> {
    info!(host = %grant.chat_server_host, "Connecting chat socket");
    let (sink, stream) = bridge
        .connector
        .connect(&grant.chat_server_host)
        .await
        .context("Failed to open chat socket")?;

    let auth = AuthParams::new(
        &bridge.client_identity,
        grant.access_token.expose_secret().to_string(),
    );
    let (state, _) = watch::channel(SessionState::Connecting);
    let shared = Arc::new(SessionShared {
        agent_id: agent_id.to_string(),
        session_id,
        bridge,
        link: SessionLink::new(sink),
        cancel: CancellationToken::new(),
        state,
        started: Instant::now(),
        last_pong_ms: AtomicU64::new(0),
        reported: AtomicBool::new(false),
        ended,
    });
    shared.advance(SessionState::Subscribing);

    let (commands, commands_rx) = mpsc::channel(COMMAND_QUEUE);
    Ok(SessionHandle {
        shared: shared.clone(),
        commands,
        tasks: vec![
            tokio::spawn(read_loop(shared.clone(), stream).instrument(span.clone())),
            tokio::spawn(keepalive_loop(shared.clone()).instrument(span.clone())),
            tokio::spawn(handshake_task(shared.clone(), auth).instrument(span.clone())),
            tokio::spawn(
                command_loop(shared, commands_rx, grant.access_token).instrument(span),
            ),
        ],
    })
}

async fn handshake_task(shared: Arc<SessionShared>, auth: AuthParams) {
    if let Err(e) = handshake(&shared, auth).await {
        if shared.cancel.is_cancelled() {
            debug!("Handshake abandoned");
        } else {
            error!(error = ?e, "Handshake failed");
            shared.end(EndReason::HandshakeFailed(format!("{e:#}")));
        }
        return;
    }
    if !shared.advance(SessionState::Active) {
        return;
    }
    info!("Session active");
    request_canned_phrases(&shared).await;
}

async fn handshake(shared: &SessionShared, auth: AuthParams) -> Result<()> {
    let settings = shared.bridge.settings.clone();

    shared.pause(settings.subscribe_delay).await?;
    let sent = shared
        .link
        .request(METHOD_SUBSCRIBE, SubscribeParams::default())
        .await
        .context("subscribe request failed")?;
    debug!(seq = sent.seq, "Subscribed");

    shared.advance(SessionState::Authenticating);
    shared.pause(settings.auth_delay).await?;
    let sent = shared
        .link
        .request(METHOD_COMETAN, auth)
        .await
        .context("authenticate request failed")?;
    debug!(seq = sent.seq, "Authentication sent");
    Ok(())
}

async fn request_canned_phrases(shared: &SessionShared) {
    if shared
        .pause(shared.bridge.settings.canned_phrases_delay)
        .await
        .is_err()
    {
        return;
    }
    match shared
        .link
        .request(METHOD_COMETAN, CannedPhrasesParams::default())
        .await
    {
        Ok(sent) => debug!(seq = sent.seq, "Requested canned phrases"),
        Err(e) => warn!(error = %e, "Canned phrases request failed"),
    }
}
