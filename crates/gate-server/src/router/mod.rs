//! Message routing: class → pool mapping, endpoint selection, and the
//! per-frame dispatch pipeline.

pub mod dispatch;
pub mod table;

pub use dispatch::Dispatcher;
pub use table::{pool_for, PoolId, RouteTable};

use crate::connection::ConnectionId;
use async_trait::async_trait;
use gate_core::Frame;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("downstream send failed: {0}")]
pub struct DownstreamError(pub String);

/// Injected capability that carries a frame to a downstream endpoint.
///
/// The dispatcher fires and forgets: replies come back asynchronously
/// through the gateway's delivery entry point, and retries (if any) belong
/// to the downstream client, not here.
#[async_trait]
pub trait DownstreamSender: Send + Sync {
    async fn send(
        &self,
        pool: PoolId,
        endpoint: SocketAddr,
        conn_id: ConnectionId,
        frame: Frame,
    ) -> Result<(), DownstreamError>;
}
