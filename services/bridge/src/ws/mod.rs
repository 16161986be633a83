//! Vendor Chat Sessions
//!
//! - `connector`: opens the socket.
//! - `link`: serialized writes and the request-sequence counter.
//! - `session`: activation handshake, session state and the handle kept in the registry.
//! - `reader`, `keepalive`, `commands`: the concurrent tasks of one live session.

mod commands;
pub mod connector;
mod keepalive;
mod link;
mod reader;
pub mod session;

pub use connector::{Connector, TungsteniteConnector, WsSink, WsStream};
pub use session::{EndReason, SessionEnded, SessionHandle, SessionState};
