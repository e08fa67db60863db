//! Gateway counters and the admin metrics snapshot.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Which drop counter a discarded frame lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropKind {
    Malformed,
    Oversize,
    Auth,
    Rate,
    Route,
}

/// Monotonic counters, written with atomic adds from every task.
#[derive(Debug)]
pub struct GatewayStats {
    started_at: Instant,
    accepted: AtomicU64,
    closed: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_oversize: AtomicU64,
    dropped_auth: AtomicU64,
    dropped_rate: AtomicU64,
    dropped_route: AtomicU64,
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            accepted: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            dropped_malformed: AtomicU64::new(0),
            dropped_oversize: AtomicU64::new(0),
            dropped_auth: AtomicU64::new(0),
            dropped_rate: AtomicU64::new(0),
            dropped_route: AtomicU64::new(0),
        }
    }

    pub fn connection_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_in(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_out(&self) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self, kind: DropKind) {
        let counter = match kind {
            DropKind::Malformed => &self.dropped_malformed,
            DropKind::Oversize => &self.dropped_oversize,
            DropKind::Auth => &self.dropped_auth,
            DropKind::Rate => &self.dropped_rate,
            DropKind::Route => &self.dropped_route,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self, kind: DropKind) -> u64 {
        let counter = match kind {
            DropKind::Malformed => &self.dropped_malformed,
            DropKind::Oversize => &self.dropped_oversize,
            DropKind::Auth => &self.dropped_auth,
            DropKind::Rate => &self.dropped_rate,
            DropKind::Route => &self.dropped_route,
        };
        counter.load(Ordering::Relaxed)
    }

    pub fn frames_in_total(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    pub fn frames_out_total(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }

    pub fn accepted_total(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Assemble the admin snapshot. Gauges that live elsewhere (active
    /// connections, auth count, bucket counts) are passed in by the caller
    /// so this type stays a plain counter block.
    pub fn snapshot(&self, gauges: SnapshotGauges) -> MetricsSnapshot {
        MetricsSnapshot {
            connections: ConnectionCounts {
                active: gauges.active_connections,
                total: self.accepted.load(Ordering::Relaxed),
            },
            frames: FrameCounts {
                inbound: self.frames_in.load(Ordering::Relaxed),
                outbound: self.frames_out.load(Ordering::Relaxed),
                dropped: DroppedCounts {
                    malformed: self.dropped_malformed.load(Ordering::Relaxed),
                    oversize: self.dropped_oversize.load(Ordering::Relaxed),
                    auth: self.dropped_auth.load(Ordering::Relaxed),
                    rate: self.dropped_rate.load(Ordering::Relaxed),
                    route: self.dropped_route.load(Ordering::Relaxed),
                },
            },
            bytes: ByteCounts {
                inbound: self.bytes_in.load(Ordering::Relaxed),
                outbound: self.bytes_out.load(Ordering::Relaxed),
            },
            auth: AuthCounts {
                authenticated: gauges.authenticated,
            },
            rate: RateCounts {
                buckets_ip: gauges.buckets_ip,
                buckets_identity: gauges.buckets_identity,
                rejected: gauges.rate_rejected,
            },
            uptime_sec: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Point-in-time gauges collected from the registries and limiter.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotGauges {
    pub active_connections: u64,
    pub authenticated: u64,
    pub buckets_ip: u64,
    pub buckets_identity: u64,
    pub rate_rejected: u64,
}

/// JSON shape served by the admin metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connections: ConnectionCounts,
    pub frames: FrameCounts,
    pub bytes: ByteCounts,
    pub auth: AuthCounts,
    pub rate: RateCounts,
    pub uptime_sec: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCounts {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameCounts {
    #[serde(rename = "in")]
    pub inbound: u64,
    #[serde(rename = "out")]
    pub outbound: u64,
    pub dropped: DroppedCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct DroppedCounts {
    pub malformed: u64,
    pub oversize: u64,
    pub auth: u64,
    pub rate: u64,
    pub route: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ByteCounts {
    #[serde(rename = "in")]
    pub inbound: u64,
    #[serde(rename = "out")]
    pub outbound: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthCounts {
    pub authenticated: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateCounts {
    pub buckets_ip: u64,
    pub buckets_identity: u64,
    pub rejected: u64,
}
