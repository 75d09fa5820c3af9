use std::io;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Bind, listen, accept, resolve or initial connect failed. Indicates
    /// misconfiguration; never retried by callers.
    #[error("startup failed during {phase}: {reason}")]
    Startup { phase: &'static str, reason: String },

    /// Retries exhausted without a graceful-end marker; the failure sentinel
    /// has been raised.
    #[error("peer lost: {0}")]
    PeerLost(String),

    #[error("stream already closed")]
    Closed,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StreamError>;
