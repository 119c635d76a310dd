//! Client-side dialing.

use super::{resolve_endpoint, Connection};
use crate::error::ConnectError;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Opens outbound connections. Each call makes exactly one attempt.
#[derive(Debug, Clone, Default)]
pub struct Dialer {
    timeout: Option<Duration>,
    keepalive: Option<Duration>,
}

impl Dialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the dial attempt. `None` waits for the OS to give up.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable TCP keepalive on the dialed socket.
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Dial `host:port`.
    ///
    /// The host must be an IP literal and the port within 1..=65535. No retry
    /// is performed.
    pub async fn connect(
        &self,
        host: &str,
        port: u32,
        parent: &CancellationToken,
    ) -> Result<Connection, ConnectError> {
        let addr = resolve_endpoint(host, port, false)?;
        debug!(%addr, timeout = ?self.timeout, "Dialing");

        let attempt = TcpStream::connect(addr);
        let result = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, attempt)
                .await
                .map_err(|_| ConnectError::TimedOut { addr, timeout })?,
            None => attempt.await,
        };

        let stream = result.map_err(|source| match source.kind() {
            io::ErrorKind::ConnectionRefused => ConnectError::Refused { addr },
            _ => ConnectError::Io { addr, source },
        })?;

        Connection::new(stream, parent, self.keepalive)
            .map_err(|source| ConnectError::Io { addr, source })
    }
}
