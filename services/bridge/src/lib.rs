//! Chat Bridge Library Crate
//!
//! Keeps one vendor chat session per online agent and relays traffic between the
//! vendor sockets and the internal message bus. The `bridge` binary is a thin
//! wrapper that wires the concrete adapters (MySQL, NATS, vendor HTTP, TLS
//! websocket) into the orchestrator.

pub mod bus;
pub mod config;
pub mod db;
pub mod orchestrator;
pub mod state;
pub mod vendor;
pub mod ws;

#[cfg(test)]
mod testing;
