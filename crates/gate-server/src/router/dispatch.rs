//! Per-frame dispatch: auth gate, rate gate, system message handling, and
//! downstream routing.
//!
//! Dispatch is invoked inline from each connection's reader, so frames on
//! one connection are processed strictly in arrival order. Every drop path
//! increments its counter and may answer with an error frame in the 9000+
//! range; none of them closes the connection.

use crate::auth::{AuthProvider, AuthRegistry};
use crate::connection::{ConnectionId, ConnectionRegistry, SendError};
use crate::limiter::RateLimiter;
use crate::metrics::{DropKind, GatewayStats};
use crate::mirror::{session_key, SessionMirror};
use crate::router::table::{pool_for, RouteTable};
use crate::router::DownstreamSender;
use gate_core::{msg, unix_millis, Frame, MessageClass};
use serde::Deserialize;
use serde_json::json;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Every Nth drop of a kind logs at warn; the rest stay at debug.
const WARN_SAMPLE: u64 = 64;

#[derive(Debug, Deserialize)]
struct LoginRequest {
    user: String,
    token: String,
}

/// Routes decoded frames through the gate pipeline.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    auth: Arc<AuthRegistry>,
    limiter: Arc<RateLimiter>,
    routes: Arc<RouteTable>,
    stats: Arc<GatewayStats>,
    auth_provider: Arc<dyn AuthProvider>,
    downstream: Arc<dyn DownstreamSender>,
    mirror: Option<Arc<dyn SessionMirror>>,
    draining: AtomicBool,
    drops_logged: AtomicU64,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        auth: Arc<AuthRegistry>,
        limiter: Arc<RateLimiter>,
        routes: Arc<RouteTable>,
        stats: Arc<GatewayStats>,
        auth_provider: Arc<dyn AuthProvider>,
        downstream: Arc<dyn DownstreamSender>,
        mirror: Option<Arc<dyn SessionMirror>>,
    ) -> Self {
        Self {
            registry,
            auth,
            limiter,
            routes,
            stats,
            auth_provider,
            downstream,
            mirror,
            draining: AtomicBool::new(false),
            drops_logged: AtomicU64::new(0),
        }
    }

    /// Refuse all further frames; called once shutdown begins.
    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::Release);
    }

    /// Run one frame through the pipeline.
    pub async fn dispatch(&self, conn_id: ConnectionId, ip: IpAddr, frame: Frame) {
        if self.draining.load(Ordering::Acquire) {
            debug!(conn_id, message_type = frame.message_type, "draining, frame refused");
            return;
        }

        let class = frame.class();
        let identity = self.auth.identity_of(conn_id);

        // Auth gate: everything outside the system range needs a login.
        if class.requires_auth() && identity.is_none() {
            self.drop_frame(DropKind::Auth, conn_id, &frame, "unauthenticated");
            self.reply_error(conn_id, msg::ERROR_UNAUTHORIZED, "not authenticated", frame.sequence);
            return;
        }

        // Rate gate: global → ip → identity, first rejection wins.
        if let Err(scope) = self.limiter.check(ip, identity.as_deref()) {
            self.drop_frame(DropKind::Rate, conn_id, &frame, scope.name());
            self.reply_error(conn_id, msg::ERROR_SERVER_BUSY, "rate limited", frame.sequence);
            return;
        }

        if class == MessageClass::System {
            self.handle_system(conn_id, frame).await;
            return;
        }

        let Some(pool) = pool_for(class) else {
            self.drop_frame(DropKind::Route, conn_id, &frame, "no pool for class");
            return;
        };
        let Some(endpoint) = self.routes.select(pool) else {
            self.drop_frame(DropKind::Route, conn_id, &frame, "no healthy endpoint");
            self.reply_error(conn_id, msg::ERROR_INTERNAL, "service unavailable", frame.sequence);
            return;
        };

        if let Err(e) = self
            .downstream
            .send(pool, endpoint, conn_id, frame.clone())
            .await
        {
            self.drop_frame(DropKind::Route, conn_id, &frame, &e.to_string());
            self.reply_error(conn_id, msg::ERROR_INTERNAL, "service unavailable", frame.sequence);
        }
    }

    async fn handle_system(&self, conn_id: ConnectionId, frame: Frame) {
        match frame.message_type {
            msg::HEARTBEAT => {
                // Echo so the client's own idle detection stays quiet.
                let pong = Frame::new(msg::HEARTBEAT, frame.sequence, unix_millis(), Vec::new());
                self.reply(conn_id, pong);
            }
            msg::LOGIN_REQUEST => self.handle_login(conn_id, frame).await,
            msg::LOGOUT_REQUEST => self.handle_logout(conn_id, frame).await,
            other => {
                self.drop_frame(DropKind::Route, conn_id, &frame, "unhandled system type");
                debug!(conn_id, message_type = other, "unhandled system message");
            }
        }
    }

    async fn handle_login(&self, conn_id: ConnectionId, frame: Frame) {
        let req: LoginRequest = match serde_json::from_slice(&frame.body) {
            Ok(req) => req,
            Err(e) => {
                debug!(conn_id, error = %e, "unparseable login body");
                self.reply_error(
                    conn_id,
                    msg::ERROR_INVALID_REQUEST,
                    "malformed login body",
                    frame.sequence,
                );
                return;
            }
        };

        match self.auth_provider.authenticate(&req.user, &req.token).await {
            Ok(identity) => {
                if let Some(evicted) = self
                    .auth
                    .authenticate(conn_id, identity.clone(), req.token)
                {
                    info!(
                        identity = %identity,
                        old_conn = evicted,
                        new_conn = conn_id,
                        "duplicate login, closing previous connection"
                    );
                    self.registry.close(evicted);
                }
                self.mirror_put(&identity, conn_id).await;
                info!(conn_id, identity = %identity, "connection authenticated");
                self.login_response(conn_id, frame.sequence, true, Some(&identity), None);
            }
            Err(e) => {
                debug!(conn_id, user = %req.user, error = %e, "authentication rejected");
                self.login_response(conn_id, frame.sequence, false, None, Some(&e.to_string()));
            }
        }
    }

    async fn handle_logout(&self, conn_id: ConnectionId, frame: Frame) {
        if let Some(info) = self.auth.deauthenticate(conn_id) {
            self.mirror_remove(&info.identity).await;
            info!(conn_id, identity = %info.identity, "connection logged out");
        }
        let body = json!({"ok": true}).to_string().into_bytes();
        let reply = Frame::new(msg::LOGOUT_RESPONSE, frame.sequence, unix_millis(), body);
        self.reply_or_close(conn_id, reply);
    }

    fn login_response(
        &self,
        conn_id: ConnectionId,
        sequence: i64,
        ok: bool,
        user: Option<&str>,
        message: Option<&str>,
    ) {
        let mut body = json!({"ok": ok});
        if let Some(user) = user {
            body["user"] = json!(user);
        }
        if let Some(message) = message {
            body["message"] = json!(message);
        }
        let reply = Frame::new(
            msg::LOGIN_RESPONSE,
            sequence,
            unix_millis(),
            body.to_string().into_bytes(),
        );
        self.reply_or_close(conn_id, reply);
    }

    /// Best-effort reply: heartbeats and error frames may be shed when the
    /// peer's queue is full.
    fn reply(&self, conn_id: ConnectionId, frame: Frame) {
        if let Err(e) = self.registry.send(conn_id, frame) {
            debug!(conn_id, error = %e, "reply dropped");
        }
    }

    /// Auth-path reply: must not be silently shed. A peer whose queue is
    /// full during login cannot learn its own auth state, so the
    /// connection is closed instead.
    fn reply_or_close(&self, conn_id: ConnectionId, frame: Frame) {
        match self.registry.send(conn_id, frame) {
            Ok(()) => {}
            Err(SendError::QueueFull) => {
                warn!(conn_id, "outbound queue full on auth reply, closing connection");
                self.registry.close(conn_id);
            }
            Err(e) => debug!(conn_id, error = %e, "auth reply dropped"),
        }
    }

    fn reply_error(&self, conn_id: ConnectionId, code: i32, message: &str, sequence: i64) {
        let body = json!({"code": code, "message": message})
            .to_string()
            .into_bytes();
        self.reply(conn_id, Frame::new(code, sequence, unix_millis(), body));
    }

    fn drop_frame(&self, kind: DropKind, conn_id: ConnectionId, frame: &Frame, reason: &str) {
        self.stats.frame_dropped(kind);
        if self.drops_logged.fetch_add(1, Ordering::Relaxed) % WARN_SAMPLE == 0 {
            warn!(
                conn_id,
                message_type = frame.message_type,
                kind = ?kind,
                reason,
                "frame dropped"
            );
        } else {
            debug!(
                conn_id,
                message_type = frame.message_type,
                kind = ?kind,
                reason,
                "frame dropped"
            );
        }
    }

    async fn mirror_put(&self, identity: &str, conn_id: ConnectionId) {
        if let Some(mirror) = &self.mirror {
            let value = conn_id.to_string();
            if let Err(e) = mirror.put(&session_key(identity), value.as_bytes()).await {
                warn!(identity = %identity, error = %e, "session mirror write failed");
            }
        }
    }

    async fn mirror_remove(&self, identity: &str) {
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.remove(&session_key(identity)).await {
                warn!(identity = %identity, error = %e, "session mirror remove failed");
            }
        }
    }
}
