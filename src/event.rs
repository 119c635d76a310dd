//! Events passed from the core to the presentation layer.
//!
//! The core calls an [`EventSink`] synchronously from its receive and probe
//! loops. Sinks must do bounded work and marshal onto their own thread or
//! loop if they need one. A panicking sink is logged and isolated.

use chrono::{DateTime, Local};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Which endpoint a channel instance represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The dialing end.
    Initiator,
    /// The accepting end.
    Acceptor,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Initiator => Side::Acceptor,
            Side::Acceptor => Side::Initiator,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Initiator => f.write_str("Initiator"),
            Side::Acceptor => f.write_str("Acceptor"),
        }
    }
}

/// Lifecycle transitions of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected,
    Disconnected,
}

/// Why a channel reached `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Orderly shutdown: the peer closed its write side.
    PeerClosed,
    /// The peer reset the connection.
    RemoteReset,
    /// The writability probe found the socket dead.
    ProbeFailed,
    /// A reportable read or write error.
    Failed(String),
    /// The shared cancellation signal was raised.
    Cancelled,
    /// Closed locally through `Session::close`.
    LocalClose,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::PeerClosed => f.write_str("peer closed the connection"),
            DisconnectReason::RemoteReset => f.write_str("connection reset by peer"),
            DisconnectReason::ProbeFailed => f.write_str("liveness probe failed"),
            DisconnectReason::Failed(e) => write!(f, "error: {e}"),
            DisconnectReason::Cancelled => f.write_str("shutdown requested"),
            DisconnectReason::LocalClose => f.write_str("closed locally"),
        }
    }
}

/// Identity of the remote end of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Opaque id: a UUID for accepted peers, `host:port` for dialed ones.
    pub id: String,
    /// The side this process plays on the channel.
    pub side: Side,
}

/// A received or transmitted line of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    origin: Side,
    timestamp: DateTime<Local>,
    payload: String,
}

impl TextMessage {
    /// Build a message stamped with the current local time.
    ///
    /// Trailing `\r` and `\n` are stripped from the payload.
    pub fn new(origin: Side, payload: impl Into<String>) -> Self {
        let mut payload = payload.into();
        let trimmed = payload.trim_end_matches(['\r', '\n']).len();
        payload.truncate(trimmed);
        Self {
            origin,
            timestamp: Local::now(),
            payload,
        }
    }

    pub fn origin(&self) -> Side {
        self.origin
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl fmt::Display for TextMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} ({})]: {}",
            self.origin,
            self.timestamp.format("%H:%M"),
            self.payload
        )
    }
}

/// Presentation-layer boundary.
///
/// All methods are fire-and-forget notifications with empty defaults.
pub trait EventSink: Send + Sync + 'static {
    fn on_connected(&self, _peer: &PeerInfo) {}

    fn on_message(&self, _peer: &PeerInfo, _message: &TextMessage) {}

    fn on_sent(&self, _peer: &PeerInfo, _message: &TextMessage) {}

    fn on_disconnected(&self, _peer: &PeerInfo, _reason: &DisconnectReason) {}

    fn on_error(&self, _peer: &PeerInfo, _message: &str) {}
}

/// Sink that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn on_connected(&self, peer: &PeerInfo) {
        info!(peer_id = %peer.id, side = %peer.side, "{} connected", peer.side.opposite());
    }

    fn on_message(&self, peer: &PeerInfo, message: &TextMessage) {
        info!(peer_id = %peer.id, "Message received: \"{}\"", message.payload().trim());
    }

    fn on_sent(&self, peer: &PeerInfo, message: &TextMessage) {
        info!(peer_id = %peer.id, "Message sent: \"{}\"", message.payload());
    }

    fn on_disconnected(&self, peer: &PeerInfo, reason: &DisconnectReason) {
        info!(peer_id = %peer.id, %reason, "{} disconnected", peer.side.opposite());
    }

    fn on_error(&self, peer: &PeerInfo, message: &str) {
        warn!(peer_id = %peer.id, "Error processing {}: {message}", peer.side.opposite());
    }
}

/// Event as seen by a [`ChannelSink`] consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected(PeerInfo),
    Message(TextMessage),
    Sent(TextMessage),
    Disconnected(DisconnectReason),
    Error(String),
}

/// Sink that forwards every event into an unbounded queue.
///
/// Lets a presentation layer consume events on its own task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SessionEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelSink {
    fn on_connected(&self, peer: &PeerInfo) {
        self.forward(SessionEvent::Connected(peer.clone()));
    }

    fn on_message(&self, _peer: &PeerInfo, message: &TextMessage) {
        self.forward(SessionEvent::Message(message.clone()));
    }

    fn on_sent(&self, _peer: &PeerInfo, message: &TextMessage) {
        self.forward(SessionEvent::Sent(message.clone()));
    }

    fn on_disconnected(&self, _peer: &PeerInfo, reason: &DisconnectReason) {
        self.forward(SessionEvent::Disconnected(reason.clone()));
    }

    fn on_error(&self, _peer: &PeerInfo, message: &str) {
        self.forward(SessionEvent::Error(message.to_string()));
    }
}

/// Run a sink callback, containing any panic it raises.
pub(crate) fn notify(peer: &PeerInfo, callback: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(peer_id = %peer.id, panic = %detail, "Event sink panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Initiator.opposite(), Side::Acceptor);
        assert_eq!(Side::Acceptor.opposite(), Side::Initiator);
    }

    #[test]
    fn test_message_trims_trailing_newline_only() {
        let msg = TextMessage::new(Side::Acceptor, "  hello world \r\n");
        assert_eq!(msg.payload(), "  hello world ");
        assert_eq!(msg.origin(), Side::Acceptor);
    }

    #[test]
    fn test_message_display() {
        let msg = TextMessage::new(Side::Initiator, "ping\n");
        let rendered = msg.to_string();
        assert!(rendered.starts_with("[Initiator ("));
        assert!(rendered.ends_with(")]: ping"));
    }

    #[test]
    fn test_notify_contains_panic() {
        let peer = PeerInfo {
            id: "p".to_string(),
            side: Side::Acceptor,
        };
        let mut reached = false;
        notify(&peer, || panic!("boom"));
        notify(&peer, || reached = true);
        assert!(reached);
    }

    #[test]
    fn test_channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        let peer = PeerInfo {
            id: "p".to_string(),
            side: Side::Initiator,
        };
        let message = TextMessage::new(Side::Acceptor, "hi");

        sink.on_connected(&peer);
        sink.on_message(&peer, &message);
        sink.on_disconnected(&peer, &DisconnectReason::PeerClosed);

        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Connected(peer));
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Message(message));
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::Disconnected(DisconnectReason::PeerClosed)
        );
    }
}
