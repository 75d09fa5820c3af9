use strand_stream::StreamError;
use strand_types::StrandError;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] StrandError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Bind/listen/accept failure on the controller's own sockets.
    #[error("startup error: {0}")]
    Startup(String),

    #[error("no worker node left in the fleet")]
    FleetExhausted,

    #[error("control protocol error: {0}")]
    Protocol(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ControlError>;
