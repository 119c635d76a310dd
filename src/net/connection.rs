//! A single TCP connection shared between a channel and its supervisor.
//!
//! The stream is split once: the read half is handed to exactly one receive
//! loop, the write half stays behind an async mutex so writes from any caller
//! are serialized. Closing is idempotent and wakes every task waiting on
//! [`Connection::closed`].

use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::trace;

/// Unanswered keepalive probes before the kernel reports `ETIMEDOUT`.
#[cfg(any(target_os = "linux", target_os = "android"))]
const KEEPALIVE_RETRIES: u32 = 3;

/// One accepted or dialed socket.
#[derive(Debug)]
pub struct Connection {
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
    /// Child of the process-wide cancellation token.
    shutdown: CancellationToken,
}

impl Connection {
    /// Wrap a connected stream.
    ///
    /// The connection is torn down when `parent` is cancelled or when
    /// [`close`](Self::close) is called, whichever comes first.
    pub fn new(
        stream: TcpStream,
        parent: &CancellationToken,
        keepalive: Option<Duration>,
    ) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(true)?;

        if let Some(idle) = keepalive {
            let params = TcpKeepalive::new().with_time(idle).with_interval(idle);
            #[cfg(any(target_os = "linux", target_os = "android"))]
            let params = params.with_retries(KEEPALIVE_RETRIES);
            SockRef::from(&stream).set_tcp_keepalive(&params)?;
        }

        let (reader, writer) = stream.into_split();

        Ok(Self {
            peer_addr,
            local_addr,
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            shutdown: parent.child_token(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Closed locally or cancelled from above.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.shutdown.is_cancelled()
    }

    /// Resolves once the connection is closed or cancelled.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Hand out the read half. Only the first caller gets it.
    pub(crate) fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Write all of `bytes`, serialized against other writers.
    ///
    /// Fails with `NotConnected` once the connection is closed. A write in
    /// flight when the connection closes is abandoned.
    pub async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) if !self.is_closed() => writer,
            _ => return Err(not_connected()),
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(not_connected()),
            result = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => result,
        }
    }

    /// Liveness check used by the supervisor probe.
    ///
    /// A connection is writable while it is open, still owns its write half
    /// and the socket reports no pending error. An in-flight write counts as
    /// writable.
    pub fn is_writable(&self) -> bool {
        self.check_writable().is_ok()
    }

    /// Like [`is_writable`](Self::is_writable), but returns the reason.
    ///
    /// A closed connection yields `NotConnected`. A pending socket error
    /// (reset, keepalive timeout) is returned as is. Reading `SO_ERROR`
    /// clears it, so the read path will not see that error again and the
    /// caller must report it.
    pub fn check_writable(&self) -> io::Result<()> {
        if self.is_closed() {
            return Err(not_connected());
        }

        let Ok(guard) = self.writer.try_lock() else {
            return Ok(());
        };

        match guard.as_ref() {
            Some(writer) => match writer.as_ref().take_error()? {
                Some(err) => Err(err),
                None => Ok(()),
            },
            None => Err(not_connected()),
        }
    }

    /// Close the connection. Returns `true` only for the call that closed it.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.shutdown.cancel();
        drop(self.take_reader());

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                trace!(peer = %self.peer_addr, error = %e, "Shutdown after close failed");
            }
        }

        trace!(peer = %self.peer_addr, "Connection closed");
        true
    }
}

#[cfg(test)]
impl Connection {
    pub(crate) fn writer_for_test(&self) -> &tokio::sync::Mutex<Option<OwnedWriteHalf>> {
        &self.writer
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}
