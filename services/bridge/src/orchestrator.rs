//! Session Orchestrator
//!
//! Owns the registry of live sessions, keyed by agent id, and is the only place
//! that inserts into or removes from it. Lifecycle events, commands and session
//! end reports are all handled by one control loop, so transitions for an agent
//! are applied in the order they arrive.

use crate::{
    state::BridgeState,
    ws::{
        SessionEnded, SessionHandle, SessionState,
        session::activate,
    },
};
use anyhow::{Context, Result, anyhow};
use chatbridge_core::command::{CommandEnvelope, LifecycleEvent};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

const CONTROL_QUEUE: usize = 1024;

/// Messages accepted by the control loop.
#[derive(Debug)]
pub enum Control {
    Lifecycle(LifecycleEvent),
    Command(CommandEnvelope),
    /// Replies with the registered agents and the state of their sessions.
    Registered(oneshot::Sender<Vec<(String, SessionState)>>),
    /// Drains every session, then stops the loop.
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable entry point into a running [`Orchestrator`].
#[derive(Clone, Debug)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Control>,
}

impl OrchestratorHandle {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<Control>) {
        let (tx, rx) = mpsc::channel(CONTROL_QUEUE);
        (Self { tx }, rx)
    }

    pub async fn lifecycle(&self, event: LifecycleEvent) -> Result<()> {
        self.send(Control::Lifecycle(event)).await
    }

    pub async fn command(&self, envelope: CommandEnvelope) -> Result<()> {
        self.send(Control::Command(envelope)).await
    }

    pub async fn registered(&self) -> Result<Vec<(String, SessionState)>> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Registered(reply)).await?;
        rx.await.context("orchestrator dropped the registry query")
    }

    /// Returns once every session has been drained.
    pub async fn shutdown(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(Control::Shutdown(done)).await?;
        rx.await.context("orchestrator stopped before draining")
    }

    async fn send(&self, control: Control) -> Result<()> {
        self.tx
            .send(control)
            .await
            .map_err(|_| anyhow!("orchestrator is not running"))
    }
}

pub struct Orchestrator {
    bridge: Arc<BridgeState>,
    registry: HashMap<String, SessionHandle>,
    control_rx: mpsc::Receiver<Control>,
    ended_tx: mpsc::UnboundedSender<SessionEnded>,
    ended_rx: mpsc::UnboundedReceiver<SessionEnded>,
}

impl Orchestrator {
    pub fn new(bridge: Arc<BridgeState>) -> (Self, OrchestratorHandle) {
        let (handle, control_rx) = OrchestratorHandle::channel();
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            bridge,
            registry: HashMap::new(),
            control_rx,
            ended_tx,
            ended_rx,
        };
        (orchestrator, handle)
    }

    /// Runs the control loop until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!("Orchestrator started");
        loop {
            tokio::select! {
                control = self.control_rx.recv() => match control {
                    Some(Control::Lifecycle(event)) => self.on_lifecycle(event).await,
                    Some(Control::Command(envelope)) => self.on_command(envelope),
                    Some(Control::Registered(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Control::Shutdown(done)) => {
                        self.drain_all().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.drain_all().await;
                        break;
                    }
                },
                Some(ended) = self.ended_rx.recv() => self.on_session_ended(ended).await,
            }
        }
        info!("Orchestrator stopped");
    }

    fn snapshot(&self) -> Vec<(String, SessionState)> {
        let mut agents: Vec<_> = self
            .registry
            .iter()
            .map(|(agent_id, session)| (agent_id.clone(), session.state()))
            .collect();
        agents.sort();
        agents
    }

    async fn on_lifecycle(&mut self, event: LifecycleEvent) {
        if event.is_online {
            self.go_online(event.agent_id).await;
        } else {
            self.go_offline(&event.agent_id).await;
        }
    }

    #[instrument(skip(self))]
    async fn go_online(&mut self, agent_id: String) {
        if self.registry.contains_key(&agent_id) {
            info!("Agent already online");
            return;
        }
        match self.start_session(&agent_id).await {
            Ok(session) => {
                self.registry.insert(agent_id.clone(), session);
                if let Err(e) = self.bridge.directory.set_online(&agent_id, true).await {
                    error!(error = ?e, "Failed to mark agent online");
                }
                info!("Agent is online");
            }
            Err(e) => error!(error = ?e, "Agent could not be brought online"),
        }
    }

    async fn start_session(&self, agent_id: &str) -> Result<SessionHandle> {
        let credentials = self
            .bridge
            .directory
            .credentials(agent_id)
            .await
            .context("Failed to load credentials")?;
        let grant = self
            .bridge
            .identity
            .login(&credentials)
            .await
            .context("Vendor login failed")?;
        activate(self.bridge.clone(), agent_id, grant, self.ended_tx.clone())
            .await
            .context("Session activation failed")
    }

    #[instrument(skip(self))]
    async fn go_offline(&mut self, agent_id: &str) {
        match self.registry.remove(agent_id) {
            Some(session) => self.release(agent_id, session).await,
            None => info!("Agent already offline"),
        }
    }

    async fn release(&self, agent_id: &str, session: SessionHandle) {
        session.close().await;
        if let Err(e) = self.bridge.directory.set_online(agent_id, false).await {
            error!(%agent_id, error = ?e, "Failed to mark agent offline");
        }
        info!(%agent_id, "Agent is offline");
    }

    async fn on_session_ended(&mut self, ended: SessionEnded) {
        let current = self
            .registry
            .get(&ended.agent_id)
            .is_some_and(|session| session.session_id() == ended.session_id);
        if !current {
            debug!(agent_id = %ended.agent_id, session_id = %ended.session_id, "Ignoring end of a released session");
            return;
        }
        if let Some(session) = self.registry.remove(&ended.agent_id) {
            warn!(agent_id = %ended.agent_id, reason = ?ended.reason, "Session ended, releasing agent");
            self.release(&ended.agent_id, session).await;
        }
    }

    fn on_command(&self, envelope: CommandEnvelope) {
        let Some(session) = self.registry.get(&envelope.agent_id) else {
            warn!(agent_id = %envelope.agent_id, command = %envelope.command_name, "Command for offline agent dropped");
            return;
        };
        let command = match envelope.decode() {
            Ok(command) => command,
            Err(e) => {
                warn!(agent_id = %envelope.agent_id, command = %envelope.command_name, error = %e, "Can't decode command");
                return;
            }
        };
        if let Err(e) = session.dispatch(command) {
            error!(agent_id = %envelope.agent_id, error = ?e, "Command not queued");
        }
    }

    async fn drain_all(&mut self) {
        info!(sessions = self.registry.len(), "Draining all sessions");
        for (agent_id, session) in std::mem::take(&mut self.registry) {
            self.release(&agent_id, session).await;
        }
    }
}
