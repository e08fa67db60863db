//! Downstream pools: ordered endpoints, health flags, round-robin cursors.

use crate::config::RoutesConfig;
use gate_core::MessageClass;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A named downstream pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolId {
    Logic,
    Chat,
    Payment,
}

impl PoolId {
    pub fn name(self) -> &'static str {
        match self {
            PoolId::Logic => "logic",
            PoolId::Chat => "chat",
            PoolId::Payment => "payment",
        }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pool serving a message class. `None` for classes the gateway handles
/// itself (system) or never forwards (error, unknown).
pub fn pool_for(class: MessageClass) -> Option<PoolId> {
    match class {
        MessageClass::Player
        | MessageClass::Bag
        | MessageClass::Battle
        | MessageClass::Activity => Some(PoolId::Logic),
        MessageClass::Chat | MessageClass::Guild => Some(PoolId::Chat),
        MessageClass::Payment => Some(PoolId::Payment),
        MessageClass::System | MessageClass::Error | MessageClass::Unknown => None,
    }
}

#[derive(Debug)]
struct Endpoint {
    addr: SocketAddr,
    healthy: AtomicBool,
}

#[derive(Debug, Default)]
struct Pool {
    endpoints: Vec<Endpoint>,
    cursor: AtomicUsize,
}

impl Pool {
    fn new(addrs: &[SocketAddr]) -> Self {
        Self {
            endpoints: addrs
                .iter()
                .map(|&addr| Endpoint {
                    addr,
                    healthy: AtomicBool::new(true),
                })
                .collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Round-robin over healthy endpoints; one full cycle without a
    /// healthy hit means the pool is effectively empty.
    fn select(&self) -> Option<SocketAddr> {
        let n = self.endpoints.len();
        if n == 0 {
            return None;
        }
        for _ in 0..n {
            let i = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
            let ep = &self.endpoints[i];
            if ep.healthy.load(Ordering::Acquire) {
                return Some(ep.addr);
            }
        }
        None
    }
}

/// Routing table for all downstream pools. Health flags are written by the
/// out-of-band health checker; the dispatcher only reads them.
#[derive(Debug)]
pub struct RouteTable {
    logic: Pool,
    chat: Pool,
    payment: Pool,
}

impl RouteTable {
    pub fn new(routes: &RoutesConfig) -> Self {
        Self {
            logic: Pool::new(&routes.logic),
            chat: Pool::new(&routes.chat),
            payment: Pool::new(&routes.payment),
        }
    }

    fn pool(&self, id: PoolId) -> &Pool {
        match id {
            PoolId::Logic => &self.logic,
            PoolId::Chat => &self.chat,
            PoolId::Payment => &self.payment,
        }
    }

    /// Pick the next healthy endpoint of `id`, advancing the cursor.
    pub fn select(&self, id: PoolId) -> Option<SocketAddr> {
        self.pool(id).select()
    }

    /// Flip an endpoint's health flag. Returns the previous state, or
    /// `None` if the endpoint is not part of the pool.
    pub fn mark_healthy(&self, id: PoolId, addr: SocketAddr, healthy: bool) -> Option<bool> {
        for ep in &self.pool(id).endpoints {
            if ep.addr == addr {
                return Some(ep.healthy.swap(healthy, Ordering::AcqRel));
            }
        }
        None
    }

    /// Every `(pool, endpoint)` pair, for the health checker.
    pub fn all_endpoints(&self) -> Vec<(PoolId, SocketAddr)> {
        let mut out = Vec::new();
        for id in [PoolId::Logic, PoolId::Chat, PoolId::Payment] {
            for ep in &self.pool(id).endpoints {
                out.push((id, ep.addr));
            }
        }
        out
    }
}
