//! Socket plumbing.
//!
//! - `Connection`: one accepted or dialed TCP stream
//! - `Listener`: binds an address and runs the accept loop
//! - `Dialer`: opens a single outbound connection

mod connection;
mod dialer;
mod listener;

pub use connection::Connection;
pub use dialer::Dialer;
pub use listener::Listener;

use crate::error::EndpointError;
use std::net::{IpAddr, SocketAddr};

/// Validate a host/port pair into a socket address.
///
/// The host must be an IP literal. Port 0 is accepted only when
/// `allow_ephemeral` is set (listening on an OS-assigned port).
pub fn resolve_endpoint(
    host: &str,
    port: u32,
    allow_ephemeral: bool,
) -> Result<SocketAddr, EndpointError> {
    let ip: IpAddr = host
        .trim()
        .parse()
        .map_err(|_| EndpointError::InvalidAddress(host.to_string()))?;

    let port = u16::try_from(port)
        .ok()
        .filter(|&p| allow_ephemeral || p != 0)
        .ok_or(EndpointError::InvalidPort(port))?;

    Ok(SocketAddr::new(ip, port))
}
