//! Per-connection IO: the reader/dispatcher loop, the writer loop, idle
//! detection, and the close cascade.
//!
//! The handler exclusively owns the socket. The registries only ever see
//! the connection id, so closing is always: cancel the token, let both
//! loops wind down, then unregister.

use super::{ConnectionId, ConnectionRegistry};
use crate::auth::AuthRegistry;
use crate::metrics::{DropKind, GatewayStats};
use crate::mirror::{session_key, SessionMirror};
use crate::router::Dispatcher;
use gate_core::{msg, unix_millis, CodecError, Frame, FrameDecoder, FrameEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A writer that cannot flush a frame within this window is fatal.
const WRITE_FLUSH_DEADLINE: Duration = Duration::from_secs(5);

/// After a close intent, the writer gets this long to drain its queue.
const WRITER_DRAIN_DEADLINE: Duration = Duration::from_secs(2);

const READ_BUF_SIZE: usize = 16 * 1024;

/// Everything one connection's IO loops need.
pub struct ConnectionHandler {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub registry: Arc<ConnectionRegistry>,
    pub auth: Arc<AuthRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub stats: Arc<GatewayStats>,
    pub mirror: Option<Arc<dyn SessionMirror>>,
    pub read_idle: Duration,
    pub write_idle: Duration,
    pub encoder: FrameEncoder,
    pub max_body: usize,
}

impl ConnectionHandler {
    /// Drive the connection until it closes, then run the cascade.
    pub async fn run(
        self,
        stream: TcpStream,
        queue_rx: mpsc::Receiver<Frame>,
        cancel: CancellationToken,
    ) {
        let (read_half, write_half) = stream.into_split();

        let writer = tokio::spawn(writer_loop(
            write_half,
            queue_rx,
            self.encoder.clone(),
            self.write_idle,
            self.stats.clone(),
            cancel.clone(),
            self.id,
        ));

        self.reader_loop(read_half, &cancel).await;

        // Close cascade: signal, drain the writer, then drop the
        // registry and auth entries.
        cancel.cancel();
        let _ = writer.await;

        self.registry.unregister(self.id);
        if let Some(auth_info) = self.auth.deauthenticate(self.id) {
            if let Some(mirror) = &self.mirror {
                if let Err(e) = mirror.remove(&session_key(&auth_info.identity)).await {
                    warn!(identity = %auth_info.identity, error = %e, "session mirror remove failed");
                }
            }
        }
        self.stats.connection_closed();
        info!(conn_id = self.id, remote = %self.remote_addr, "connection closed");
    }

    async fn reader_loop(&self, mut read_half: OwnedReadHalf, cancel: &CancellationToken) {
        let mut decoder = FrameDecoder::with_max_body(self.max_body);
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = timeout(self.read_idle, read_half.read(&mut buf)) => match result {
                    Err(_) => {
                        info!(conn_id = self.id, idle = ?self.read_idle, "read idle timeout, closing");
                        return;
                    }
                    Ok(Ok(0)) => {
                        debug!(conn_id = self.id, "peer closed connection");
                        return;
                    }
                    Ok(Ok(n)) => {
                        self.stats.bytes_in(n as u64);
                        match decoder.feed(&buf[..n]) {
                            Ok(frames) => {
                                for frame in frames {
                                    self.stats.frame_in();
                                    // Inline dispatch keeps per-connection order.
                                    self.dispatcher
                                        .dispatch(self.id, self.remote_addr.ip(), frame)
                                        .await;
                                }
                            }
                            Err(e) => {
                                let kind = match e {
                                    CodecError::Oversize(_) => DropKind::Oversize,
                                    CodecError::Malformed(_) | CodecError::Decompress(_) => {
                                        DropKind::Malformed
                                    }
                                };
                                self.stats.frame_dropped(kind);
                                warn!(conn_id = self.id, error = %e, "protocol error, closing connection");
                                return;
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        debug!(conn_id = self.id, error = %e, "read error");
                        return;
                    }
                }
            }
        }
    }
}

async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut queue_rx: mpsc::Receiver<Frame>,
    encoder: FrameEncoder,
    write_idle: Duration,
    stats: Arc<GatewayStats>,
    cancel: CancellationToken,
    conn_id: ConnectionId,
) {
    let mut heartbeat_seq: i64 = 0;
    let mut last_write = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = queue_rx.recv() => match maybe {
                Some(frame) => {
                    if write_frame(&mut write_half, &encoder, &frame, &stats, conn_id)
                        .await
                        .is_err()
                    {
                        cancel.cancel();
                        return;
                    }
                    last_write = Instant::now();
                }
                None => break,
            },
            _ = tokio::time::sleep_until(last_write + write_idle) => {
                heartbeat_seq += 1;
                let beat = Frame::new(msg::HEARTBEAT, heartbeat_seq, unix_millis(), Vec::new());
                debug!(conn_id, seq = heartbeat_seq, "write idle, emitting heartbeat");
                if write_frame(&mut write_half, &encoder, &beat, &stats, conn_id)
                    .await
                    .is_err()
                {
                    cancel.cancel();
                    return;
                }
                last_write = Instant::now();
            }
        }
    }

    // Close intent received: flush whatever is already queued, bounded.
    let drain_deadline = Instant::now() + WRITER_DRAIN_DEADLINE;
    while let Ok(frame) = queue_rx.try_recv() {
        if Instant::now() >= drain_deadline {
            debug!(conn_id, "drain deadline hit, discarding remaining frames");
            break;
        }
        if write_frame(&mut write_half, &encoder, &frame, &stats, conn_id)
            .await
            .is_err()
        {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn write_frame(
    write_half: &mut OwnedWriteHalf,
    encoder: &FrameEncoder,
    frame: &Frame,
    stats: &GatewayStats,
    conn_id: ConnectionId,
) -> Result<(), ()> {
    let bytes = match encoder.encode(frame) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(conn_id, error = %e, "outbound frame failed to encode");
            return Err(());
        }
    };
    match timeout(WRITE_FLUSH_DEADLINE, write_half.write_all(&bytes)).await {
        Ok(Ok(())) => {
            stats.frame_out();
            stats.bytes_out(bytes.len() as u64);
            Ok(())
        }
        Ok(Err(e)) => {
            debug!(conn_id, error = %e, "write error");
            Err(())
        }
        Err(_) => {
            warn!(conn_id, deadline = ?WRITE_FLUSH_DEADLINE, "write deadline exceeded");
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutesConfig;
    use crate::limiter::RateLimiter;
    use crate::router::RouteTable;
    use crate::testutil::{AcceptTokenAuth, RecordingDownstream};
    use gate_core::codec::HEADER_LEN;
    use tokio::net::TcpListener;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        auth: Arc<AuthRegistry>,
        dispatcher: Arc<Dispatcher>,
        stats: Arc<GatewayStats>,
        downstream: Arc<RecordingDownstream>,
        root: CancellationToken,
        read_idle: Duration,
        write_idle: Duration,
    }

    impl Fixture {
        fn new(read_idle: Duration, write_idle: Duration) -> Self {
            let registry = Arc::new(ConnectionRegistry::new(64));
            let auth = Arc::new(AuthRegistry::new());
            let stats = Arc::new(GatewayStats::new());
            let downstream = Arc::new(RecordingDownstream::default());
            let routes = RoutesConfig {
                logic: vec!["10.0.0.1:9001".parse().unwrap()],
                chat: vec![],
                payment: vec![],
            };
            let dispatcher = Arc::new(Dispatcher::new(
                registry.clone(),
                auth.clone(),
                Arc::new(RateLimiter::new(10_000, 20_000, 1000)),
                Arc::new(RouteTable::new(&routes)),
                stats.clone(),
                Arc::new(AcceptTokenAuth),
                downstream.clone(),
                None,
            ));
            Self {
                registry,
                auth,
                dispatcher,
                stats,
                downstream,
                root: CancellationToken::new(),
                read_idle,
                write_idle,
            }
        }

        /// Accept one connection and run a handler for it; returns the
        /// client-side stream and the handler's join handle.
        async fn spawn_one(&self) -> (TcpStream, tokio::task::JoinHandle<()>, ConnectionId) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let client = TcpStream::connect(addr).await.unwrap();
            let (server_stream, remote_addr) = listener.accept().await.unwrap();

            let registration = self.registry.register(remote_addr, &self.root);
            let id = registration.id;
            let handler = ConnectionHandler {
                id,
                remote_addr,
                registry: self.registry.clone(),
                auth: self.auth.clone(),
                dispatcher: self.dispatcher.clone(),
                stats: self.stats.clone(),
                mirror: None,
                read_idle: self.read_idle,
                write_idle: self.write_idle,
                encoder: FrameEncoder::default(),
                max_body: gate_core::DEFAULT_MAX_BODY,
            };
            let handle = tokio::spawn(handler.run(
                server_stream,
                registration.queue_rx,
                registration.cancel,
            ));
            (client, handle, id)
        }
    }

    async fn read_one_frame(client: &mut TcpStream) -> Frame {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed while waiting for a frame");
            let mut frames = decoder.feed(&buf[..n]).unwrap();
            if let Some(frame) = frames.pop() {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn idle_reader_closes_the_connection() {
        let fx = Fixture::new(Duration::from_millis(200), Duration::from_secs(60));
        let (mut client, handle, id) = fx.spawn_one().await;

        // Stay silent past the read-idle deadline.
        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("server should close an idle connection")
            .unwrap();
        assert_eq!(n, 0);

        handle.await.unwrap();
        assert!(!fx.registry.contains(id));
        assert_eq!(fx.stats.dropped(DropKind::Malformed), 0);
    }

    #[tokio::test]
    async fn write_idle_emits_heartbeat() {
        let fx = Fixture::new(Duration::from_secs(60), Duration::from_millis(100));
        let (mut client, _handle, _id) = fx.spawn_one().await;

        let beat = timeout(Duration::from_secs(2), read_one_frame(&mut client))
            .await
            .expect("expected a heartbeat before the timeout");
        assert_eq!(beat.message_type, msg::HEARTBEAT);
        assert!(beat.body.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_round_trip_through_both_loops() {
        let fx = Fixture::new(Duration::from_secs(60), Duration::from_secs(60));
        let (mut client, _handle, _id) = fx.spawn_one().await;

        let ping = Frame::new(msg::HEARTBEAT, 9, unix_millis(), Vec::new());
        let bytes = FrameEncoder::default().encode(&ping).unwrap();
        client.write_all(&bytes).await.unwrap();

        let pong = timeout(Duration::from_secs(2), read_one_frame(&mut client))
            .await
            .expect("expected heartbeat echo");
        assert_eq!(pong.message_type, msg::HEARTBEAT);
        assert_eq!(pong.sequence, 9);
        assert_eq!(fx.stats.frames_in_total(), 1);
    }

    #[tokio::test]
    async fn bad_magic_closes_and_counts_malformed() {
        let fx = Fixture::new(Duration::from_secs(60), Duration::from_secs(60));
        let (mut client, handle, id) = fx.spawn_one().await;

        let mut bytes = FrameEncoder::default()
            .encode(&Frame::new(msg::HEARTBEAT, 1, 0, Vec::new()))
            .unwrap();
        bytes[4] = 0xde; // corrupt the magic
        client.write_all(&bytes).await.unwrap();

        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("server should close on protocol error")
            .unwrap();
        assert_eq!(n, 0);

        handle.await.unwrap();
        assert_eq!(fx.stats.dropped(DropKind::Malformed), 1);
        assert!(!fx.registry.contains(id));
    }

    #[tokio::test]
    async fn oversize_header_closes_and_counts() {
        let fx = Fixture::new(Duration::from_secs(60), Duration::from_secs(60));
        let (mut client, handle, _id) = fx.spawn_one().await;

        // Outer prefix declaring a 20 MiB body.
        let outer = (HEADER_LEN + 20 * 1024 * 1024) as u32;
        client.write_all(&outer.to_be_bytes()).await.unwrap();

        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("server should close on oversize frame")
            .unwrap();
        assert_eq!(n, 0);

        handle.await.unwrap();
        assert_eq!(fx.stats.dropped(DropKind::Oversize), 1);
        assert_eq!(fx.stats.frames_in_total(), 0);
    }

    #[tokio::test]
    async fn login_and_forward_through_real_sockets() {
        let fx = Fixture::new(Duration::from_secs(60), Duration::from_secs(60));
        let (mut client, _handle, id) = fx.spawn_one().await;
        let enc = FrameEncoder::default();

        let login = Frame::new(
            msg::LOGIN_REQUEST,
            1,
            unix_millis(),
            br#"{"user":"u1","token":"tok"}"#.to_vec(),
        );
        client.write_all(&enc.encode(&login).unwrap()).await.unwrap();

        let reply = timeout(Duration::from_secs(2), read_one_frame(&mut client))
            .await
            .expect("expected login response");
        assert_eq!(reply.message_type, msg::LOGIN_RESPONSE);

        let game = Frame::new(msg::PLAYER_MOVE, 2, unix_millis(), b"{}".to_vec());
        client.write_all(&enc.encode(&game).unwrap()).await.unwrap();

        // Forwarding is async from the client's point of view; poll briefly.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let sent = fx.downstream.sent();
            if !sent.is_empty() {
                assert_eq!(sent[0].2, id);
                assert_eq!(sent[0].3.message_type, msg::PLAYER_MOVE);
                break;
            }
            assert!(Instant::now() < deadline, "downstream never saw the frame");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The close cascade also clears auth state.
        drop(client);
        let deadline = Instant::now() + Duration::from_secs(2);
        while fx.auth.is_authenticated(id) {
            assert!(Instant::now() < deadline, "auth entry not cleaned up");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
