//! Error handling for hyprmirror

/// Result type alias for mirror operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mirror operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Mirror for {key} unavailable after {attempts} attempt(s): {reason}")]
    UpstreamUnavailable {
        key: String,
        attempts: usize,
        reason: String,
    },

    #[error("Mirror resolution for {key} exceeded deadline of {timeout_ms}ms after {attempts} attempt(s)")]
    DeadlineExceeded {
        key: String,
        attempts: usize,
        timeout_ms: u64,
    },

    #[error("Content store error: {0}")]
    Store(String),

    #[error("Router error: {0}")]
    Router(String),

    #[error("libp2p error: {0}")]
    Libp2p(String),

    #[error("Bootstrap error: {0}")]
    Bootstrap(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

// libp2p error conversions
impl From<libp2p::swarm::DialError> for Error {
    fn from(err: libp2p::swarm::DialError) -> Self {
        Error::Libp2p(format!("Dial error: {err}"))
    }
}

impl From<libp2p::noise::Error> for Error {
    fn from(err: libp2p::noise::Error) -> Self {
        Error::Libp2p(format!("Noise error: {err}"))
    }
}

impl From<libp2p::TransportError<std::io::Error>> for Error {
    fn from(err: libp2p::TransportError<std::io::Error>) -> Self {
        Error::Libp2p(format!("Transport error: {err}"))
    }
}

impl From<libp2p::multiaddr::Error> for Error {
    fn from(err: libp2p::multiaddr::Error) -> Self {
        Error::Libp2p(format!("Multiaddr error: {err}"))
    }
}

impl From<libp2p::kad::store::Error> for Error {
    fn from(err: libp2p::kad::store::Error) -> Self {
        Error::Router(format!("Provider store error: {err}"))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::Router(format!("Router closed before replying: {err}"))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Router(format!("Router is not running: {err}"))
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Create a content store error
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Error::Store(msg.into())
    }

    /// Create a router error
    pub fn router<S: Into<String>>(msg: S) -> Self {
        Error::Router(msg.into())
    }

    /// Create a bootstrap error
    pub fn bootstrap<S: Into<String>>(msg: S) -> Self {
        Error::Bootstrap(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    /// Create a generic error
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Error::Other(msg.into())
    }

    /// Whether the error means the content simply is not available here
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
