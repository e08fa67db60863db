//! Gateway supervisor: accept loop, background sweeps, health checks, and
//! graceful shutdown.

use crate::auth::{AuthProvider, AuthRegistry};
use crate::config::GatewayConfig;
use crate::connection::handler::ConnectionHandler;
use crate::connection::{ConnectionId, ConnectionRegistry, SendError};
use crate::error::GateResult;
use crate::limiter::RateLimiter;
use crate::metrics::{GatewayStats, MetricsSnapshot, SnapshotGauges};
use crate::mirror::SessionMirror;
use crate::router::{Dispatcher, DownstreamSender, RouteTable};
use gate_core::{Frame, FrameEncoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BUCKET_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const AUTH_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const STATS_INTERVAL: Duration = Duration::from_secs(30);
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Outbound queue depth per connection.
const SEND_QUEUE_CAPACITY: usize = 256;

/// Every Nth admission rejection logs at warn.
const ACCEPT_WARN_SAMPLE: u64 = 256;

/// The gateway instance: owns the registries, limiter, routing table, and
/// the shutdown token every connection hangs off.
pub struct GateServer {
    config: GatewayConfig,
    registry: Arc<ConnectionRegistry>,
    auth: Arc<AuthRegistry>,
    limiter: Arc<RateLimiter>,
    routes: Arc<RouteTable>,
    stats: Arc<GatewayStats>,
    dispatcher: Arc<Dispatcher>,
    mirror: Option<Arc<dyn SessionMirror>>,
    shutdown: CancellationToken,
    admission_rejects: AtomicU64,
}

impl GateServer {
    /// Wire the gateway from its configuration and injected capabilities.
    pub fn new(
        config: GatewayConfig,
        auth_provider: Arc<dyn AuthProvider>,
        downstream: Arc<dyn DownstreamSender>,
        mirror: Option<Arc<dyn SessionMirror>>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(SEND_QUEUE_CAPACITY));
        let auth = Arc::new(AuthRegistry::new());
        let limiter = Arc::new(RateLimiter::new(
            config.global_qps,
            config.global_burst,
            config.refill_period_ms,
        ));
        let routes = Arc::new(RouteTable::new(&config.routes));
        let stats = Arc::new(GatewayStats::new());

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            auth.clone(),
            limiter.clone(),
            routes.clone(),
            stats.clone(),
            auth_provider,
            downstream,
            mirror.clone(),
        ));

        Self {
            config,
            registry,
            auth,
            limiter,
            routes,
            stats,
            dispatcher,
            mirror,
            shutdown: CancellationToken::new(),
            admission_rejects: AtomicU64::new(0),
        }
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Assemble the admin metrics snapshot.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let (buckets_ip, buckets_identity) = self.limiter.bucket_counts();
        self.stats.snapshot(SnapshotGauges {
            active_connections: self.registry.len() as u64,
            authenticated: self.auth.count() as u64,
            buckets_ip: buckets_ip as u64,
            buckets_identity: buckets_identity as u64,
            rate_rejected: self.limiter.rejected_total(),
        })
    }

    /// Deliver a downstream reply to a client connection. This is the
    /// entry point the downstream integration calls when responses come
    /// back asynchronously.
    pub fn deliver(&self, conn_id: ConnectionId, frame: Frame) -> Result<(), SendError> {
        self.registry.send(conn_id, frame)
    }

    /// Enqueue a frame to every live connection; returns how many took it.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        self.registry.broadcast(frame)
    }

    /// Bind the configured listen address and serve until shutdown.
    ///
    /// Returns `Ok(true)` when every connection drained within the
    /// shutdown deadline, `Ok(false)` when stragglers had to be abandoned.
    /// A bind failure is a startup error.
    pub async fn run(self: Arc<Self>) -> GateResult<bool> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, "gateway listening");
        self.serve(listener).await
    }

    /// Serve on an already-bound listener (the accept loop).
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> GateResult<bool> {
        Self::spawn_sweepers(&self);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, remote_addr)) => Self::accept_connection(&self, stream, remote_addr),
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }

        // Stop taking connections first, then drain the live ones.
        drop(listener);
        info!(active = self.registry.len(), "shutdown: listener closed, draining");
        self.dispatcher.set_draining();
        self.registry.close_all();

        let drained = self.wait_for_drain(self.config.shutdown).await;
        if drained {
            info!("shutdown complete, all connections drained");
        } else {
            warn!(
                remaining = self.registry.len(),
                deadline = ?self.config.shutdown,
                "shutdown deadline exceeded, abandoning stragglers"
            );
        }
        Ok(drained)
    }

    fn accept_connection(server: &Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        if server.registry.len() >= server.config.max_connections {
            if server.admission_rejects.fetch_add(1, Ordering::Relaxed) % ACCEPT_WARN_SAMPLE == 0 {
                warn!(
                    remote = %remote_addr,
                    max = server.config.max_connections,
                    "connection limit reached, rejecting"
                );
            }
            return;
        }

        let _ = stream.set_nodelay(true);
        server.stats.connection_accepted();
        let registration = server.registry.register(remote_addr, &server.shutdown);
        info!(
            conn_id = registration.id,
            remote = %remote_addr,
            active = server.registry.len(),
            "connection accepted"
        );

        let handler = ConnectionHandler {
            id: registration.id,
            remote_addr,
            registry: server.registry.clone(),
            auth: server.auth.clone(),
            dispatcher: server.dispatcher.clone(),
            stats: server.stats.clone(),
            mirror: server.mirror.clone(),
            read_idle: server.config.read_idle,
            write_idle: server.config.write_idle,
            encoder: FrameEncoder::new(
                server.config.compress_threshold,
                server.config.max_body_bytes,
            ),
            max_body: server.config.max_body_bytes,
        };
        tokio::spawn(handler.run(stream, registration.queue_rx, registration.cancel));
    }

    /// Background jobs: bucket eviction, auth consistency, endpoint health
    /// probing, and the periodic stats line. All stop with the shutdown
    /// token.
    fn spawn_sweepers(this: &Arc<Self>) {
        let server = this.clone();
        tokio::spawn(async move {
            let mut ticker = interval(BUCKET_SWEEP_INTERVAL);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = server.shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        server.limiter.sweep();
                    }
                }
            }
        });

        let server = this.clone();
        tokio::spawn(async move {
            let mut ticker = interval(AUTH_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = server.shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        let removed = server
                            .auth
                            .retain_live(|conn| server.registry.contains(conn));
                        if removed > 0 {
                            debug!(removed, "auth sweep dropped stale entries");
                        }
                    }
                }
            }
        });

        let server = this.clone();
        tokio::spawn(async move {
            let mut ticker = interval(HEALTH_CHECK_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = server.shutdown.cancelled() => return,
                    _ = ticker.tick() => server.probe_endpoints().await,
                }
            }
        });

        let server = this.clone();
        tokio::spawn(async move {
            let mut ticker = interval(STATS_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = server.shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        info!(
                            active = server.registry.len(),
                            authenticated = server.auth.count(),
                            frames_in = server.stats.frames_in_total(),
                            frames_out = server.stats.frames_out_total(),
                            "gateway stats"
                        );
                    }
                }
            }
        });
    }

    /// Probe every routed endpoint with a bounded TCP connect and record
    /// health transitions.
    async fn probe_endpoints(&self) {
        for (pool, addr) in self.routes.all_endpoints() {
            let healthy = matches!(
                timeout(HEALTH_PROBE_TIMEOUT, TcpStream::connect(addr)).await,
                Ok(Ok(_))
            );
            if let Some(previous) = self.routes.mark_healthy(pool, addr, healthy) {
                if previous != healthy {
                    if healthy {
                        info!(pool = %pool, endpoint = %addr, "endpoint recovered");
                    } else {
                        warn!(pool = %pool, endpoint = %addr, "endpoint unhealthy");
                    }
                }
            }
        }
    }

    async fn wait_for_drain(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while !self.registry.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        true
    }
}
