//! Connection lifecycle: registry lookups and per-connection IO tasks.

pub mod handler;
pub mod registry;

pub use registry::{ConnectionRegistry, SendError};

/// Process-unique connection identifier.
///
/// Assigned monotonically by the registry and never reused for the
/// lifetime of the process.
pub type ConnectionId = u64;
