//! Optional write-through session mirror.
//!
//! When configured, login and logout are mirrored to an external cache as
//! opaque key/value pairs. The mirror is write-only: nothing is ever read
//! back, and mirror failures are logged but never affect the connection.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("session mirror error: {0}")]
pub struct MirrorError(pub String);

/// Injected capability for mirroring session bindings to an external store.
#[async_trait]
pub trait SessionMirror: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), MirrorError>;

    async fn remove(&self, key: &str) -> Result<(), MirrorError>;
}

/// Mirror key for an identity's session binding.
pub fn session_key(identity: &str) -> String {
    format!("gateway:session:{identity}")
}
