//! gate-server binary: CLI wiring for the gateway.

use async_trait::async_trait;
use clap::Parser;
use gate_core::Frame;
use gate_server::auth::{AuthError, AuthProvider};
use gate_server::connection::ConnectionId;
use gate_server::router::{DownstreamError, DownstreamSender, PoolId};
use gate_server::{GateServer, GatewayConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

/// gate-server — game gateway
#[derive(Parser, Debug)]
#[command(name = "gate-server", version, about = "Game gateway server")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Listen address override (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "starting gate-server"
    );

    let config = match GatewayConfig::load(Some(&cli.config), cli.listen.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = Arc::new(GateServer::new(
        config,
        Arc::new(PermissiveAuth),
        Arc::new(LogOnlyDownstream),
        None,
    ));

    // Trigger shutdown from SIGTERM / ctrl-c.
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        shutdown.cancel();
    });

    match server.run().await {
        Ok(true) => info!("gate-server stopped"),
        Ok(false) => {
            error!("shutdown deadline exceeded");
            std::process::exit(2);
        }
        Err(e) => {
            error!(error = %e, "server error");
            std::process::exit(1);
        }
    }
}

/// Stand-in credential validator: accepts any non-empty user and token.
///
/// The real deployment injects a backend that validates tokens; until one
/// is wired the gateway behaves like an open test realm.
struct PermissiveAuth;

#[async_trait]
impl AuthProvider for PermissiveAuth {
    async fn authenticate(&self, user: &str, token: &str) -> Result<String, AuthError> {
        if user.is_empty() || token.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(user.to_string())
    }
}

/// Stand-in downstream: logs the dispatch and drops the frame. The RPC
/// transport to the service pools is a separate component; it implements
/// [`DownstreamSender`] and answers through [`GateServer::deliver`].
struct LogOnlyDownstream;

#[async_trait]
impl DownstreamSender for LogOnlyDownstream {
    async fn send(
        &self,
        pool: PoolId,
        endpoint: SocketAddr,
        conn_id: ConnectionId,
        frame: Frame,
    ) -> Result<(), DownstreamError> {
        debug!(
            pool = %pool,
            endpoint = %endpoint,
            conn_id,
            message_type = frame.message_type,
            "dispatching frame downstream"
        );
        Ok(())
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
