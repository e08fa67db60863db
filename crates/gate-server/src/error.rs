use gate_core::CodecError;
use thiserror::Error;

/// Errors produced by the gateway.
///
/// Only `Config` and `Io` surfaced from startup are process-fatal; frame
/// and connection level failures are recovered where they occur and never
/// reach the supervisor.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("config error: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type GateResult<T> = Result<T, GateError>;
