//! Gateway configuration: TOML file + CLI overrides.

use crate::error::{GateError, GateResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub listen: ListenSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub frame: FrameSection,
    #[serde(default)]
    pub routes: RoutesSection,
}

/// `[listen]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenSection {
    #[serde(default = "default_listen_addr")]
    pub addr: String,
}

impl Default for ListenSection {
    fn default() -> Self {
        Self {
            addr: default_listen_addr(),
        }
    }
}

/// `[limits]` section: connection cap and rate-limiter parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_global_qps")]
    pub global_qps: u64,
    #[serde(default = "default_global_burst")]
    pub global_burst: u64,
    #[serde(default = "default_refill_period_ms")]
    pub refill_period_ms: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            global_qps: default_global_qps(),
            global_burst: default_global_burst(),
            refill_period_ms: default_refill_period_ms(),
        }
    }
}

/// `[timeouts]` section, all in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_read_idle_sec")]
    pub read_idle_sec: u64,
    #[serde(default = "default_write_idle_sec")]
    pub write_idle_sec: u64,
    #[serde(default = "default_shutdown_sec")]
    pub shutdown_sec: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            read_idle_sec: default_read_idle_sec(),
            write_idle_sec: default_write_idle_sec(),
            shutdown_sec: default_shutdown_sec(),
        }
    }
}

/// `[frame]` section: codec bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameSection {
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_compress_threshold")]
    pub compress_threshold: usize,
}

impl Default for FrameSection {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
            compress_threshold: default_compress_threshold(),
        }
    }
}

/// `[routes]` section: downstream pool endpoints as `host:port` strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutesSection {
    #[serde(default)]
    pub logic: Vec<String>,
    #[serde(default)]
    pub chat: Vec<String>,
    #[serde(default)]
    pub payment: Vec<String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8090".to_string()
}
fn default_max_connections() -> usize {
    100_000
}
fn default_global_qps() -> u64 {
    10_000
}
fn default_global_burst() -> u64 {
    20_000
}
fn default_refill_period_ms() -> u64 {
    1000
}
fn default_read_idle_sec() -> u64 {
    60
}
fn default_write_idle_sec() -> u64 {
    30
}
fn default_shutdown_sec() -> u64 {
    30
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_compress_threshold() -> usize {
    1024
}

/// Resolved endpoints per downstream pool.
#[derive(Debug, Clone, Default)]
pub struct RoutesConfig {
    pub logic: Vec<SocketAddr>,
    pub chat: Vec<SocketAddr>,
    pub payment: Vec<SocketAddr>,
}

/// Resolved gateway configuration (addresses parsed, CLI overrides applied).
///
/// Produced by [`GatewayConfig::load`]. Invalid values are a startup error:
/// the process must exit with code 1 rather than run with a partial config.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Client-facing TCP listen address.
    pub listen_addr: SocketAddr,
    /// Admission cap on concurrent connections.
    pub max_connections: usize,
    /// Global rate limit in tokens per refill period.
    pub global_qps: u64,
    /// Global bucket capacity.
    pub global_burst: u64,
    /// Refill period for every bucket, in milliseconds.
    pub refill_period_ms: u64,
    /// Close a connection after this long without inbound bytes.
    pub read_idle: Duration,
    /// Emit a heartbeat after this long without outbound bytes.
    pub write_idle: Duration,
    /// Grace period between shutdown signal and forced close.
    pub shutdown: Duration,
    /// Body ceiling, before and after decompression.
    pub max_body_bytes: usize,
    /// Bodies above this size are compressed on the way out.
    pub compress_threshold: usize,
    /// Downstream pool endpoints.
    pub routes: RoutesConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        // The file defaults are the single source of truth.
        Self::resolve(ConfigFile::default(), None).expect("defaults must resolve")
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; defaults are used. A file that
    /// exists but cannot be parsed is a startup error.
    pub fn load(config_path: Option<&Path>, cli_listen: Option<&str>) -> GateResult<Self> {
        let file_config = match config_path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path)
                    .map_err(|e| GateError::Config(format!("read {}: {e}", path.display())))?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| GateError::Config(format!("parse {}: {e}", path.display())))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli_listen)
    }

    fn resolve(file: ConfigFile, cli_listen: Option<&str>) -> GateResult<Self> {
        let listen_str = cli_listen.unwrap_or(&file.listen.addr);
        let listen_addr: SocketAddr = listen_str
            .parse()
            .map_err(|e| GateError::Config(format!("invalid listen address {listen_str:?}: {e}")))?;

        if file.limits.global_qps == 0 || file.limits.global_burst == 0 {
            return Err(GateError::Config(
                "limits.global_qps and limits.global_burst must be positive".into(),
            ));
        }
        if file.limits.refill_period_ms == 0 {
            return Err(GateError::Config("limits.refill_period_ms must be positive".into()));
        }

        let routes = RoutesConfig {
            logic: parse_endpoints("routes.logic", &file.routes.logic)?,
            chat: parse_endpoints("routes.chat", &file.routes.chat)?,
            payment: parse_endpoints("routes.payment", &file.routes.payment)?,
        };

        Ok(Self {
            listen_addr,
            max_connections: file.limits.max_connections,
            global_qps: file.limits.global_qps,
            global_burst: file.limits.global_burst,
            refill_period_ms: file.limits.refill_period_ms,
            read_idle: Duration::from_secs(file.timeouts.read_idle_sec),
            write_idle: Duration::from_secs(file.timeouts.write_idle_sec),
            shutdown: Duration::from_secs(file.timeouts.shutdown_sec),
            max_body_bytes: file.frame.max_body_bytes,
            compress_threshold: file.frame.compress_threshold,
            routes,
        })
    }
}

fn parse_endpoints(key: &str, raw: &[String]) -> GateResult<Vec<SocketAddr>> {
    raw.iter()
        .map(|s| {
            s.parse()
                .map_err(|e| GateError::Config(format!("invalid endpoint {s:?} in {key}: {e}")))
        })
        .collect()
}
