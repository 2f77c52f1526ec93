//! Error types for the protection exchange

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for protection operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while protecting a socket
#[derive(Debug, Error)]
pub enum Error {
    /// The protector's channel could not be opened
    #[error("protector unreachable at {}: {source}", path.display())]
    ProtectorUnreachable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Sending the descriptor was rejected by the OS or the peer
    #[error("failed to send fd {fd} to protector: {source}")]
    ProtectorSend {
        fd: i32,
        #[source]
        source: io::Error,
    },

    /// The protector closed the channel without acknowledging
    #[error("protector closed the channel without acknowledging fd {fd}")]
    ProtectorClosed { fd: i32 },

    /// A step of the exchange did not finish in time
    #[error("protector timed out during {stage} for fd {fd}")]
    ProtectorTimeout { fd: i32, stage: Stage },

    /// Malformed framing on the protection channel
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Step of the protection exchange, used in timeout reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Send,
    Acknowledge,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Connect => write!(f, "connect"),
            Stage::Send => write!(f, "send"),
            Stage::Acknowledge => write!(f, "acknowledge"),
        }
    }
}

impl Error {
    /// The protector could not be reached or dropped the exchange
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Error::ProtectorUnreachable { .. }
                | Error::ProtectorSend { .. }
                | Error::ProtectorClosed { .. }
        )
    }

    /// Check if this is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ProtectorTimeout { .. })
    }
}
