//! Listening socket and accept loop.

use super::{resolve_endpoint, Connection};
use crate::error::{AcceptError, BindError};
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Pending connection queue length passed to `listen(2)`.
const BACKLOG: i32 = 1024;

/// A bound listening socket.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    keepalive: Option<Duration>,
    connection_limit: Option<Arc<Semaphore>>,
}

impl Listener {
    /// Validate `host:port` and bind to it.
    ///
    /// Port 0 binds an OS-assigned port; see [`local_addr`](Self::local_addr).
    pub fn bind(host: &str, port: u32) -> Result<Self, BindError> {
        let addr = resolve_endpoint(host, port, true)?;
        Self::bind_addr(addr)
    }

    /// Bind an already validated address.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind_addr(addr: SocketAddr) -> Result<Self, BindError> {
        let io_err = |source: io::Error| match source.kind() {
            io::ErrorKind::AddrInUse => BindError::AddrInUse(addr),
            _ => BindError::Io { addr, source },
        };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(io_err)?;
        socket.set_reuse_address(true).map_err(io_err)?;
        socket.set_nonblocking(true).map_err(io_err)?;
        socket.bind(&addr.into()).map_err(io_err)?;
        socket.listen(BACKLOG).map_err(io_err)?;

        let inner = TcpListener::from_std(socket.into()).map_err(io_err)?;
        let local_addr = inner.local_addr().map_err(io_err)?;

        info!(address = %local_addr, "Server listening");

        Ok(Self {
            inner,
            local_addr,
            keepalive: None,
            connection_limit: None,
        })
    }

    /// Enable TCP keepalive on accepted sockets.
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Cap the number of connections whose handlers are still running.
    ///
    /// Values above [`Semaphore::MAX_PERMITS`] are clamped to it.
    pub fn with_connection_limit(mut self, max_connections: usize) -> Self {
        let permits = max_connections.min(Semaphore::MAX_PERMITS);
        self.connection_limit = Some(Arc::new(Semaphore::new(permits)));
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one connection.
    ///
    /// The returned connection is cancelled together with `parent`.
    pub async fn accept(&self, parent: &CancellationToken) -> Result<Connection, AcceptError> {
        let (stream, _) = self.inner.accept().await?;
        Ok(Connection::new(stream, parent, self.keepalive)?)
    }

    /// Accept connections until `cancel` is raised.
    ///
    /// Each connection is passed to `on_accepted` and the returned future is
    /// spawned on `tracker`, never run inline. Transient accept failures are
    /// logged and skipped; anything else ends the loop with an error.
    /// Cancellation ends the loop with `Ok(())`.
    pub async fn accept_loop<F, Fut>(
        &self,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
        on_accepted: F,
    ) -> Result<(), AcceptError>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            // Wait for a connection slot
            let permit = match &self.connection_limit {
                Some(limit) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    permit = Arc::clone(limit).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = self.accept(cancel) => accepted,
            };

            match accepted {
                Ok(conn) => {
                    debug!(peer = %conn.peer_addr(), "New connection");
                    let handler = on_accepted(conn);
                    tracker.spawn(async move {
                        handler.await;
                        drop(permit);
                    });
                }
                Err(AcceptError::Io(e)) if is_transient(&e) => {
                    warn!(error = %e, "Failed to accept connection");
                }
                Err(e) => return Err(e),
            }
        }

        debug!(address = %self.local_addr, "Accept loop stopped");
        Ok(())
    }
}

/// Accept failures caused by a single peer rather than the listener.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = Listener::bind("127.0.0.1", 0).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_connection_limit_is_clamped() {
        let listener = Listener::bind("127.0.0.1", 0)
            .unwrap()
            .with_connection_limit(usize::MAX);
        let limit = listener.connection_limit.as_ref().unwrap();
        assert_eq!(limit.available_permits(), Semaphore::MAX_PERMITS);
    }

    #[tokio::test]
    async fn test_bind_used_port_fails() {
        let first = Listener::bind("127.0.0.1", 0).unwrap();
        let port = first.local_addr().port();

        let err = Listener::bind("127.0.0.1", port as u32).unwrap_err();
        assert!(matches!(err, BindError::AddrInUse(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_bind_invalid_endpoint() {
        assert!(matches!(
            Listener::bind("999.0.0.1", 8080),
            Err(BindError::Endpoint(_))
        ));
        assert!(matches!(
            Listener::bind("127.0.0.1", 100_000),
            Err(BindError::Endpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_accept_loop_hands_off_and_cancels() {
        let listener = Listener::bind("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        let loop_cancel = cancel.clone();
        let loop_tracker = tracker.clone();
        let handle = tokio::spawn(async move {
            listener
                .accept_loop(&loop_cancel, &loop_tracker, move |_conn| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await
        });

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();

        for _ in 0..100 {
            if accepted.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("accept loop should observe cancellation")
            .unwrap();
        assert!(result.is_ok());

        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_stuck_handler_does_not_block_accepts() {
        let listener = Listener::bind("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        let loop_cancel = cancel.clone();
        let loop_tracker = tracker.clone();
        let handle = tokio::spawn(async move {
            listener
                .accept_loop(&loop_cancel, &loop_tracker, move |_conn| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        std::future::pending::<()>().await;
                    }
                })
                .await
        });

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        let _c = TcpStream::connect(addr).await.unwrap();

        for _ in 0..100 {
            if accepted.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 3);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
