//! Shared Bridge State
//!
//! The collaborators every session needs, created once at startup and handed to
//! the orchestrator. Everything sits behind a trait object so the control loop
//! can run against in-memory fakes.

use crate::{config::SessionSettings, ws::Connector};
use chatbridge_core::{
    directory::Directory, identity::IdentityProvider, protocol::ClientIdentity,
    publisher::EventPublisher, upload::MediaTransfer,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct BridgeState {
    pub directory: Arc<dyn Directory>,
    pub identity: Arc<dyn IdentityProvider>,
    pub media: Arc<dyn MediaTransfer>,
    pub publisher: Arc<dyn EventPublisher>,
    pub connector: Arc<dyn Connector>,
    pub settings: Arc<SessionSettings>,
    pub client_identity: ClientIdentity,
}
