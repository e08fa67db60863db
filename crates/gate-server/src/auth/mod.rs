//! Authentication: the injected credential validator and the
//! connection ↔ identity registry.

pub mod registry;

pub use registry::{AuthInfo, AuthRegistry};

use async_trait::async_trait;
use thiserror::Error;

/// Authenticated user identity.
pub type Identity = String;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("auth backend unavailable: {0}")]
    Unavailable(String),
}

/// Injected capability that validates login credentials.
///
/// The gateway never mints or inspects tokens itself; whatever backs this
/// trait (JWT validation, an account service, a test stub) decides.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Validate `(user, token)` and return the canonical identity.
    async fn authenticate(&self, user: &str, token: &str) -> Result<Identity, AuthError>;
}
