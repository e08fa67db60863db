use thiserror::Error;

/// Errors produced by the frame codec.
///
/// Every variant is fatal for the connection that produced it: once the
/// byte stream is out of sync there is no safe way to resynchronize, so
/// the owning connection must be closed.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Bad magic, an impossible length prefix, or a header that
    /// contradicts its outer frame.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Declared or decompressed body size outside `[0, max_body]`.
    #[error("oversize frame body: {0} bytes")]
    Oversize(i64),

    /// Snappy decompression failed.
    #[error("decompress failed: {0}")]
    Decompress(String),
}

pub type CodecResult<T> = Result<T, CodecError>;
