//! Error types for dialing

use thiserror::Error;

/// Result type alias for dial operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while dialing
#[derive(Debug, Error)]
pub enum Error {
    /// The socket could not be protected before connecting
    #[error("protection failed: {0}")]
    Protect(#[from] hop_protect::Error),

    /// Unknown or unsupported network name
    #[error("invalid network: {0}")]
    InvalidNetwork(String),

    /// Malformed dial address
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Resolution produced no address usable with the requested network
    #[error("no suitable address found for {0}")]
    NoAddress(String),

    /// DNS query/response error
    #[error("DNS error: {0}")]
    Dns(String),

    /// Caller-supplied deadline expired
    #[error("timeout: {0}")]
    Timeout(String),

    /// Caller cancelled the dial
    #[error("dial cancelled")]
    Cancelled,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Requested feature is not available on this platform
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if the dial failed in the protection phase
    pub fn is_protect_error(&self) -> bool {
        matches!(self, Error::Protect(_))
    }

    /// Check if the protector could not be reached or dropped the exchange
    pub fn is_protector_unavailable(&self) -> bool {
        matches!(self, Error::Protect(e) if e.is_unavailable())
    }

    /// Check if a deadline expired, either the caller's or the protector's
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Protect(e) => e.is_timeout(),
            Error::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}
