//! WolfStore Error Types

use thiserror::Error;

/// Result type alias for WolfStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// A single peer that could not be written during a broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFailure {
    /// Peer identity (remote address)
    pub peer: String,
    /// Rendered cause
    pub reason: String,
}

impl std::fmt::Display for PeerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.peer, self.reason)
    }
}

/// WolfStore error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Storage errors
    #[error("Store write failed for key {key}: {source}")]
    StoreWrite {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    // Codec errors
    #[error("Payload decode failed: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Codec(#[from] bincode::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Dial to {address} failed: {reason}")]
    Dial { address: String, reason: String },

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Frame checksum mismatch")]
    ChecksumMismatch,

    #[error("Broadcast failed for {}/{attempted} peers: {}", .failed.len(), render_failures(.failed))]
    Broadcast {
        attempted: usize,
        failed: Vec<PeerFailure>,
    },

    #[error("Transport closed")]
    TransportClosed,

    #[error("Inbound message stream already consumed")]
    ConsumerTaken,

    // Lifecycle errors
    #[error("Server already started")]
    AlreadyStarted,

    #[error("Shutdown in progress")]
    ShuttingDown,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn render_failures(failed: &[PeerFailure]) -> String {
    failed
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Dial { .. } | Error::Network(_) | Error::Io(_)
        )
    }

    /// Peers that missed a broadcast, if this is a broadcast failure
    pub fn failed_peers(&self) -> &[PeerFailure] {
        match self {
            Error::Broadcast { failed, .. } => failed,
            _ => &[],
        }
    }
}
