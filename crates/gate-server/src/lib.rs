//! gate-server: front-edge game gateway.
//!
//! Terminates client TCP connections, authenticates them, enforces rate
//! limits, and forwards framed messages to the logic/chat/payment pools.
//! The downstream RPC transport, the auth backend, and the optional
//! session mirror are injected capabilities; see [`auth::AuthProvider`],
//! [`router::DownstreamSender`], and [`mirror::SessionMirror`].

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod mirror;
pub mod router;
pub mod server;

#[cfg(test)]
pub mod testutil;

// Re-export the types a host binary needs to wire a gateway.
pub use config::GatewayConfig;
pub use error::{GateError, GateResult};
pub use server::GateServer;
