//! Test doubles for the injected capabilities.

use crate::auth::{AuthError, AuthProvider};
use crate::connection::ConnectionId;
use crate::router::{DownstreamError, DownstreamSender, PoolId};
use async_trait::async_trait;
use gate_core::Frame;
use std::net::SocketAddr;
use std::sync::Mutex;

/// Accepts any user whose token is exactly `"tok"`; identity is the user.
pub struct AcceptTokenAuth;

#[async_trait]
impl AuthProvider for AcceptTokenAuth {
    async fn authenticate(&self, user: &str, token: &str) -> Result<String, AuthError> {
        if token == "tok" {
            Ok(user.to_string())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }
}

/// Records every forwarded frame; optionally fails every send.
#[derive(Default)]
pub struct RecordingDownstream {
    pub sent: Mutex<Vec<(PoolId, SocketAddr, ConnectionId, Frame)>>,
    pub fail: bool,
}

impl RecordingDownstream {
    pub fn sent(&self) -> Vec<(PoolId, SocketAddr, ConnectionId, Frame)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DownstreamSender for RecordingDownstream {
    async fn send(
        &self,
        pool: PoolId,
        endpoint: SocketAddr,
        conn_id: ConnectionId,
        frame: Frame,
    ) -> Result<(), DownstreamError> {
        if self.fail {
            return Err(DownstreamError("stub failure".into()));
        }
        self.sent.lock().unwrap().push((pool, endpoint, conn_id, frame));
        Ok(())
    }
}
