//! Connection registry: id → outbound queue and close handle.
//!
//! The registry holds no transport state. Each connection's handler owns
//! the socket; the registry only keeps the bounded outbound queue sender
//! and the cancellation token used to request a close.

use super::ConnectionId;
use dashmap::DashMap;
use gate_core::Frame;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why a targeted send did not enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("connection not found")]
    NotFound,
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    QueueFull,
}

#[derive(Debug)]
struct ConnEntry {
    remote_addr: SocketAddr,
    queue: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

/// What a new connection's handler needs to run its IO loops.
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    pub queue_rx: mpsc::Receiver<Frame>,
    pub cancel: CancellationToken,
}

/// Shared lookup table for all live connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    conns: DashMap<ConnectionId, ConnEntry>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            conns: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_capacity,
        }
    }

    /// Add a connection and hand back its id, outbound queue receiver, and
    /// close token (a child of `parent` so server shutdown cascades).
    pub fn register(&self, remote_addr: SocketAddr, parent: &CancellationToken) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity);
        let cancel = parent.child_token();

        self.conns.insert(
            id,
            ConnEntry {
                remote_addr,
                queue: queue_tx,
                cancel: cancel.clone(),
            },
        );
        debug!(conn_id = id, remote = %remote_addr, "connection registered");

        Registration {
            id,
            queue_rx,
            cancel,
        }
    }

    /// Remove a connection. No-op if it is already gone.
    pub fn unregister(&self, id: ConnectionId) {
        if self.conns.remove(&id).is_some() {
            debug!(conn_id = id, "connection unregistered");
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.conns.contains_key(&id)
    }

    pub fn remote_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.conns.get(&id).map(|e| e.remote_addr)
    }

    /// Enqueue a frame for one connection's writer. Never blocks: a slow
    /// peer surfaces as `QueueFull` and the caller picks the drop policy.
    pub fn send(&self, id: ConnectionId, frame: Frame) -> Result<(), SendError> {
        let entry = self.conns.get(&id).ok_or(SendError::NotFound)?;
        if entry.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        entry.queue.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Enqueue a frame on every live connection; returns how many accepted
    /// it. Per-connection failures are counted out, not raised.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        let mut delivered = 0;
        for entry in self.conns.iter() {
            if entry.cancel.is_cancelled() {
                continue;
            }
            if entry.queue.try_send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Ask one connection to run its close cascade.
    pub fn close(&self, id: ConnectionId) {
        if let Some(entry) = self.conns.get(&id) {
            entry.cancel.cancel();
        }
    }

    /// Ask every connection to close.
    pub fn close_all(&self) {
        for entry in self.conns.iter() {
            entry.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn frame() -> Frame {
        Frame::new(gate_core::msg::HEARTBEAT, 1, 0, Vec::new())
    }

    #[test]
    fn ids_are_unique_and_monotonic() {
        let reg = ConnectionRegistry::new(4);
        let root = CancellationToken::new();
        let a = reg.register(addr(), &root);
        let b = reg.register(addr(), &root);
        let c = reg.register(addr(), &root);
        assert!(a.id < b.id && b.id < c.id);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn unregister_is_idempotent() {
        let reg = ConnectionRegistry::new(4);
        let root = CancellationToken::new();
        let r = reg.register(addr(), &root);
        assert_eq!(reg.remote_addr(r.id), Some(addr()));
        reg.unregister(r.id);
        reg.unregister(r.id);
        assert!(!reg.contains(r.id));
        assert_eq!(reg.remote_addr(r.id), None);
        assert_eq!(reg.len(), 0);
    }

    #[tokio::test]
    async fn send_reaches_the_queue() {
        let reg = ConnectionRegistry::new(4);
        let root = CancellationToken::new();
        let mut r = reg.register(addr(), &root);
        reg.send(r.id, frame()).unwrap();
        let got = r.queue_rx.recv().await.unwrap();
        assert_eq!(got.message_type, gate_core::msg::HEARTBEAT);
    }

    #[test]
    fn send_to_unknown_is_not_found() {
        let reg = ConnectionRegistry::new(4);
        assert_eq!(reg.send(999, frame()), Err(SendError::NotFound));
    }

    #[test]
    fn send_to_full_queue_fails_without_blocking() {
        let reg = ConnectionRegistry::new(2);
        let root = CancellationToken::new();
        let r = reg.register(addr(), &root);
        reg.send(r.id, frame()).unwrap();
        reg.send(r.id, frame()).unwrap();
        assert_eq!(reg.send(r.id, frame()), Err(SendError::QueueFull));
    }

    #[test]
    fn send_to_cancelled_connection_is_closed() {
        let reg = ConnectionRegistry::new(4);
        let root = CancellationToken::new();
        let r = reg.register(addr(), &root);
        reg.close(r.id);
        assert_eq!(reg.send(r.id, frame()), Err(SendError::Closed));
    }

    #[test]
    fn broadcast_counts_live_connections_only() {
        let reg = ConnectionRegistry::new(4);
        let root = CancellationToken::new();
        let _a = reg.register(addr(), &root);
        let _b = reg.register(addr(), &root);
        let c = reg.register(addr(), &root);
        reg.close(c.id);

        assert_eq!(reg.broadcast(&frame()), 2);
    }

    #[test]
    fn close_all_cancels_every_token() {
        let reg = ConnectionRegistry::new(4);
        let root = CancellationToken::new();
        let a = reg.register(addr(), &root);
        let b = reg.register(addr(), &root);
        reg.close_all();
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
    }

    #[test]
    fn server_shutdown_cascades_to_connections() {
        let reg = ConnectionRegistry::new(4);
        let root = CancellationToken::new();
        let r = reg.register(addr(), &root);
        root.cancel();
        assert!(r.cancel.is_cancelled());
    }
}
