use thiserror::Error;

/// Errors produced by the transport. Handshake code maps most of these onto
/// reply tags before they ever surface; steady-state code routes them through
/// the pipe's fault handling instead of returning them to callers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("bad banner from peer")]
    BadMagic,

    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    BadProtocolVersion { ours: u32, theirs: u32 },

    #[error("peer is missing required features {missing:#x}")]
    FeatureMismatch { missing: u64 },

    #[error("authorizer rejected")]
    AuthRejected,

    #[error("crc mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("message aborted by sender")]
    AbortedMessage,

    #[error("session reset by peer")]
    PeerReset,

    #[error("connection closed locally")]
    LocalClosed,

    #[error("timed out")]
    Timeout,

    #[error("shutdown requested")]
    ShutdownRequested,
}

impl From<bytes::TryGetError> for TransportError {
    fn from(e: bytes::TryGetError) -> Self {
        TransportError::Decode(format!("short buffer: {}", e))
    }
}
