//! Error types for bridgesyncd.

use thiserror::Error;

use swbridge_types::PoolExhausted;

#[derive(Debug, Error)]
pub enum BridgesyncError {
    /// Missing link, neighbor, or port mapping. Recoverable: the
    /// operation is skipped and the periodic resync repairs state.
    #[error("not found: {0}")]
    NotFound(String),

    /// Packet pool empty; the frame is dropped.
    #[error(transparent)]
    PoolExhausted(#[from] PoolExhausted),

    /// Control channel down while a programming call was attempted.
    #[error("control channel not connected")]
    NotConnected,

    /// Input rejected at the translator boundary, never forwarded to
    /// the table driver.
    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("netlink error: {0}")]
    Netlink(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// Fatal: the process must not proceed (e.g. the kernel
    /// notification channel cannot be opened).
    #[error("critical initialization failure: {0}")]
    Critical(String),
}

/// Result type alias for bridgesyncd operations.
pub type Result<T> = std::result::Result<T, BridgesyncError>;
