//! Rendezvous relay between remote-control agents and the controllers that drive them.
//!
//! Peers connect over a WebSocket, register in one role, and the relay forwards
//! control messages to agents and telemetry back to controllers. In auto-discovery
//! mode every controller sees every agent; in code-pairing mode each controller is
//! issued a six-digit code and only sees the agents that presented it.

pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod notifier;
pub mod pairing;
pub mod probe;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod telemetry;
pub mod websocket;
