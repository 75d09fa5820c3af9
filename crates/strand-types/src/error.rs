// Shared error type for configuration and wire-format handling.

#[derive(Debug, thiserror::Error)]
pub enum StrandError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("wire format error: {0}")]
    Wire(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StrandError>;
