//! Error types for configuration, socket setup and steady-state channel I/O.
//!
//! Fatal classes (`ConfigError`, `BindError`, `AcceptError`) end the process.
//! `ChannelError` only ever ends the connection it was raised on.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Invalid host or port supplied before any socket is touched.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Invalid IP address ({0})")]
    InvalidAddress(String),

    #[error("Invalid port {0}")]
    InvalidPort(u32),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid endpoint: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failure to bind the listening socket.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("Invalid endpoint: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Address {0} is already in use")]
    AddrInUse(SocketAddr),

    #[error("Failed to bind {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Unrecoverable failure of the accept path.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("Failed to accept connection: {0}")]
    Io(#[from] io::Error),
}

/// Client-side dial failure. The connection was never established.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Invalid endpoint: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Connection to {addr} refused")]
    Refused { addr: SocketAddr },

    #[error("Connection to {addr} timed out after {timeout:?}")]
    TimedOut { addr: SocketAddr, timeout: Duration },

    #[error("Failed to connect to {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Steady-state read/write failure on a single connection.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Connection is not writable")]
    NotWritable,

    #[error("Message cannot be sent as a single line: {0}")]
    InvalidPayload(String),

    #[error("A receive loop is already running on this channel")]
    ReadLoopActive,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Fatal server failure.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Accept(#[from] AcceptError),
}

/// Client run failure.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Failed to read input: {0}")]
    Input(#[source] io::Error),
}

/// Whether an I/O error means the peer went away abruptly.
///
/// These are normal disconnects, not application errors.
pub fn is_remote_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_reset_classification() {
        assert!(is_remote_reset(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_remote_reset(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_remote_reset(&io::Error::from(io::ErrorKind::InvalidData)));
        assert!(!is_remote_reset(&io::Error::from(io::ErrorKind::TimedOut)));
    }

    #[test]
    fn test_endpoint_error_display() {
        let err = EndpointError::InvalidAddress("not-an-ip".to_string());
        assert_eq!(err.to_string(), "Invalid IP address (not-an-ip)");
        assert_eq!(EndpointError::InvalidPort(70000).to_string(), "Invalid port 70000");
    }

    #[test]
    fn test_bind_error_wraps_endpoint() {
        let err: BindError = EndpointError::InvalidPort(99999).into();
        assert_eq!(err.to_string(), "Invalid endpoint: Invalid port 99999");
    }
}
