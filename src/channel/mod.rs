//! Text-message channel over a single connection.
//!
//! The receive loop turns socket reads into [`TextMessage`]s and reports
//! them through the connection's [`Lifecycle`]; [`MessageChannel::send`]
//! frames outgoing text. Sends may run concurrently with the receive loop
//! and are serialized against each other by the connection's write lock.

pub mod framing;

pub use framing::{FrameReader, Framing};

use crate::error::{is_remote_reset, ChannelError};
use crate::event::{DisconnectReason, PeerInfo, Side, TextMessage};
use crate::net::Connection;
use crate::relay::Responder;
use crate::supervisor::{Lifecycle, SessionSettings};
use std::io;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Message-level view of a connection.
pub struct MessageChannel {
    conn: Arc<Connection>,
    lifecycle: Arc<Lifecycle>,
    framing: Framing,
    buffer_size: usize,
    responder: Option<Arc<dyn Responder>>,
}

impl MessageChannel {
    pub fn new(conn: Arc<Connection>, lifecycle: Arc<Lifecycle>, settings: &SessionSettings) -> Self {
        Self {
            conn,
            lifecycle,
            framing: settings.framing,
            buffer_size: settings.buffer_size,
            responder: None,
        }
    }

    /// Reply policy consulted for every received message.
    pub fn with_responder(mut self, responder: Option<Arc<dyn Responder>>) -> Self {
        self.responder = responder;
        self
    }

    pub fn side(&self) -> Side {
        self.lifecycle.peer().side
    }

    pub fn peer(&self) -> &PeerInfo {
        self.lifecycle.peer()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Send one line of text.
    ///
    /// Empty or whitespace-only text is ignored. Text that would not arrive
    /// as one message fails with [`ChannelError::InvalidPayload`] and writes
    /// nothing. Fails with [`ChannelError::NotWritable`] once the connection
    /// is closed. Any other write failure ends the connection.
    pub async fn send(&self, text: &str) -> Result<(), ChannelError> {
        let Some(frame) = framing::encode(text)? else {
            trace!(peer_id = %self.peer().id, "Ignoring blank message");
            return Ok(());
        };

        if let Err(e) = self.conn.check_writable() {
            if e.kind() != io::ErrorKind::NotConnected {
                // The pending socket error is consumed here, not by the reader.
                self.fail(&e);
                self.conn.close().await;
            }
            return Err(ChannelError::NotWritable);
        }

        if let Err(e) = self.conn.write(&frame).await {
            if e.kind() == io::ErrorKind::NotConnected {
                return Err(ChannelError::NotWritable);
            }
            self.fail(&e);
            self.conn.close().await;
            return Err(e.into());
        }

        let message = TextMessage::new(self.side(), text);
        debug!(peer_id = %self.peer().id, bytes = frame.len(), "Message sent");
        self.lifecycle
            .deliver(|sink, peer| sink.on_sent(peer, &message));
        Ok(())
    }

    /// Read until the peer closes, an error occurs or the connection is
    /// cancelled.
    ///
    /// Ends the lifecycle with the matching [`DisconnectReason`] and closes
    /// the connection on the way out. Only one receive loop may run per
    /// channel.
    pub async fn receive_loop(&self) -> Result<(), ChannelError> {
        let Some(reader) = self.conn.take_reader() else {
            if self.conn.is_closed() {
                self.lifecycle.disconnect(DisconnectReason::Cancelled);
                return Ok(());
            }
            return Err(ChannelError::ReadLoopActive);
        };

        let mut frames = FrameReader::new(reader, self.framing, self.buffer_size);
        debug!(peer_id = %self.peer().id, framing = ?self.framing, "Receive loop started");

        let reason = loop {
            let batch = tokio::select! {
                biased;
                _ = self.conn.closed() => break DisconnectReason::Cancelled,
                batch = frames.next_batch() => batch,
            };

            match batch {
                Ok(Some(messages)) => {
                    for payload in messages {
                        self.dispatch(payload).await;
                    }
                }
                Ok(None) => break DisconnectReason::PeerClosed,
                Err(e) if is_remote_reset(&e) => {
                    debug!(peer_id = %self.peer().id, error = %e, "Connection reset by peer");
                    break DisconnectReason::RemoteReset;
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    warn!(peer_id = %self.peer().id, error = %e, "Keepalive timed out");
                    break DisconnectReason::ProbeFailed;
                }
                Err(e) => {
                    self.fail(&e);
                    break DisconnectReason::Failed(e.to_string());
                }
            }
        };

        // No-op if the probe or a local close already ended the lifecycle.
        self.lifecycle.disconnect(reason);
        drop(frames);
        self.conn.close().await;
        Ok(())
    }

    async fn dispatch(&self, payload: String) {
        let message = TextMessage::new(self.side().opposite(), payload);
        debug!(peer_id = %self.peer().id, bytes = message.payload().len(), "Message received");

        let delivered = self
            .lifecycle
            .deliver(|sink, peer| sink.on_message(peer, &message));
        if !delivered {
            return;
        }

        let Some(responder) = &self.responder else {
            return;
        };
        if let Some(reply) = responder.respond(&message) {
            if let Err(e) = self.send(&reply).await {
                debug!(peer_id = %self.peer().id, error = %e, "Failed to send reply");
            }
        }
    }

    /// Report a read/write error that is not a plain disconnect.
    fn fail(&self, err: &io::Error) {
        if is_remote_reset(err) {
            self.lifecycle.disconnect(DisconnectReason::RemoteReset);
            return;
        }

        warn!(peer_id = %self.peer().id, error = %err, "Connection error");
        let message = err.to_string();
        self.lifecycle
            .deliver(|sink, peer| sink.on_error(peer, &message));
        self.lifecycle
            .disconnect(DisconnectReason::Failed(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChannelSink, EventSink, SessionEvent};
    use crate::supervisor::LinkState;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        channel: Arc<MessageChannel>,
        lifecycle: Arc<Lifecycle>,
        peer: TcpStream,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        token: CancellationToken,
    }

    async fn fixture(framing: Framing) -> Fixture {
        fixture_with_sink(framing, |sink| Arc::new(sink)).await
    }

    async fn fixture_with_sink(
        framing: Framing,
        wrap: impl FnOnce(ChannelSink) -> Arc<dyn EventSink>,
    ) -> Fixture {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let token = CancellationToken::new();
        let conn = Arc::new(Connection::new(accepted.unwrap().0, &token, None).unwrap());
        let (sink, events) = ChannelSink::new();
        let lifecycle = Arc::new(Lifecycle::new(
            PeerInfo {
                id: "test-peer".to_string(),
                side: Side::Acceptor,
            },
            wrap(sink),
        ));
        lifecycle.connect();

        let settings = SessionSettings {
            framing,
            ..SessionSettings::default()
        };
        let channel = Arc::new(MessageChannel::new(conn, Arc::clone(&lifecycle), &settings));

        Fixture {
            channel,
            lifecycle,
            peer: client.unwrap(),
            events,
            token,
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended")
    }

    #[tokio::test]
    async fn test_send_appends_newline() {
        let mut f = fixture(Framing::Line).await;
        f.channel.send("ping").await.unwrap();

        let mut buf = [0u8; 16];
        let n = f.peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping\n");

        assert!(matches!(next_event(&mut f.events).await, SessionEvent::Connected(_)));
        match next_event(&mut f.events).await {
            SessionEvent::Sent(msg) => {
                assert_eq!(msg.payload(), "ping");
                assert_eq!(msg.origin(), Side::Acceptor);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blank_send_writes_nothing() {
        let mut f = fixture(Framing::Line).await;
        f.channel.send("   ").await.unwrap();
        f.channel.send("").await.unwrap();
        f.channel.send("real").await.unwrap();

        let mut buf = [0u8; 16];
        let n = f.peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"real\n");
    }

    #[tokio::test]
    async fn test_send_rejects_interior_line_break() {
        let mut f = fixture(Framing::Line).await;
        assert!(matches!(
            f.channel.send("a\nb").await,
            Err(ChannelError::InvalidPayload(_))
        ));
        f.channel.send("after").await.unwrap();

        let mut buf = [0u8; 16];
        let n = f.peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"after\n");
    }

    #[tokio::test]
    async fn test_send_rejects_overlong_line() {
        let mut f = fixture(Framing::Line).await;
        let long = "x".repeat(100_000);
        assert!(matches!(
            f.channel.send(&long).await,
            Err(ChannelError::InvalidPayload(_))
        ));
        f.channel.send("after").await.unwrap();

        let mut buf = [0u8; 16];
        let n = f.peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"after\n");

        // Only the accepted send is reported.
        assert!(matches!(next_event(&mut f.events).await, SessionEvent::Connected(_)));
        match next_event(&mut f.events).await {
            SessionEvent::Sent(msg) => assert_eq!(msg.payload(), "after"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peer_reset_is_a_plain_disconnect() {
        let Fixture {
            channel,
            peer,
            mut events,
            ..
        } = fixture(Framing::Line).await;
        let loop_channel = Arc::clone(&channel);
        let handle = tokio::spawn(async move { loop_channel.receive_loop().await });

        socket2::SockRef::from(&peer)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(peer);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should end on reset")
            .unwrap()
            .unwrap();

        let mut all = Vec::new();
        while let Ok(event) = events.try_recv() {
            all.push(event);
        }
        assert_eq!(all.len(), 2, "unexpected events: {:?}", all);
        assert!(matches!(all[0], SessionEvent::Connected(_)));
        assert_eq!(all[1], SessionEvent::Disconnected(DisconnectReason::RemoteReset));
        assert!(channel.connection().is_closed());
    }

    #[tokio::test]
    async fn test_panicking_sink_does_not_stop_loop() {
        struct PanicsOnBoom(ChannelSink);

        impl EventSink for PanicsOnBoom {
            fn on_message(&self, peer: &PeerInfo, message: &TextMessage) {
                if message.payload() == "boom" {
                    panic!("sink failure");
                }
                self.0.on_message(peer, message);
            }

            fn on_disconnected(&self, peer: &PeerInfo, reason: &DisconnectReason) {
                self.0.on_disconnected(peer, reason);
            }
        }

        let mut f = fixture_with_sink(Framing::Line, |sink| Arc::new(PanicsOnBoom(sink))).await;
        let channel = Arc::clone(&f.channel);
        let handle = tokio::spawn(async move { channel.receive_loop().await });

        f.peer.write_all(b"boom\nstill here\n").await.unwrap();
        f.peer.shutdown().await.unwrap();

        handle.await.unwrap().unwrap();

        let mut all = Vec::new();
        while let Ok(event) = f.events.try_recv() {
            all.push(event);
        }
        let payloads: Vec<_> = all
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Message(m) => Some(m.payload().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec!["still here"]);
        assert_eq!(
            all.last(),
            Some(&SessionEvent::Disconnected(DisconnectReason::PeerClosed))
        );
    }

    #[tokio::test]
    async fn test_send_after_close_is_not_writable() {
        let f = fixture(Framing::Line).await;
        f.channel.connection().close().await;
        assert!(matches!(
            f.channel.send("late").await,
            Err(ChannelError::NotWritable)
        ));
    }

    #[tokio::test]
    async fn test_receive_loop_emits_messages_then_disconnect() {
        let mut f = fixture(Framing::Line).await;
        let channel = Arc::clone(&f.channel);
        let handle = tokio::spawn(async move { channel.receive_loop().await });

        f.peer.write_all(b"hello\n\n  \nworld\n").await.unwrap();
        f.peer.shutdown().await.unwrap();

        handle.await.unwrap().unwrap();

        let mut events = Vec::new();
        while let Ok(event) = f.events.try_recv() {
            events.push(event);
        }
        let payloads: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Message(m) => Some(m.payload().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec!["hello", "world"]);
        assert!(matches!(events.first(), Some(SessionEvent::Connected(_))));
        assert_eq!(
            events.last(),
            Some(&SessionEvent::Disconnected(DisconnectReason::PeerClosed))
        );
        assert!(f.channel.connection().is_closed());
    }

    #[tokio::test]
    async fn test_received_message_attributed_to_opposite_side() {
        let mut f = fixture(Framing::Line).await;
        let channel = Arc::clone(&f.channel);
        tokio::spawn(async move { channel.receive_loop().await });

        f.peer.write_all(b"from initiator\n").await.unwrap();

        assert!(matches!(next_event(&mut f.events).await, SessionEvent::Connected(_)));
        match next_event(&mut f.events).await {
            SessionEvent::Message(msg) => {
                assert_eq!(msg.origin(), Side::Initiator);
                assert_eq!(msg.payload(), "from initiator");
            }
            other => panic!("unexpected: {:?}", other),
        }
        f.token.cancel();
    }

    #[tokio::test]
    async fn test_second_receive_loop_rejected() {
        let f = fixture(Framing::Line).await;
        let channel = Arc::clone(&f.channel);
        tokio::spawn(async move { channel.receive_loop().await });

        // Give the first loop a chance to take the reader.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            f.channel.receive_loop().await,
            Err(ChannelError::ReadLoopActive)
        ));
        f.token.cancel();
    }

    #[tokio::test]
    async fn test_cancellation_ends_loop() {
        let mut f = fixture(Framing::Line).await;
        let channel = Arc::clone(&f.channel);
        let handle = tokio::spawn(async move { channel.receive_loop().await });

        f.token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should observe cancellation")
            .unwrap()
            .unwrap();

        assert_eq!(f.lifecycle.state(), LinkState::Disconnected);
        assert!(matches!(next_event(&mut f.events).await, SessionEvent::Connected(_)));
        assert_eq!(
            next_event(&mut f.events).await,
            SessionEvent::Disconnected(DisconnectReason::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_responder_replies_in_loop() {
        let mut f = fixture(Framing::Line).await;
        let channel = Arc::new(
            MessageChannel::new(
                Arc::clone(f.channel.connection()),
                Arc::clone(&f.lifecycle),
                &SessionSettings::default(),
            )
            .with_responder(Some(Arc::new(|msg: &TextMessage| {
                Some(format!("echo: {}", msg.payload()))
            }))),
        );
        tokio::spawn(async move { channel.receive_loop().await });

        f.peer.write_all(b"abc\n").await.unwrap();
        let mut buf = [0u8; 32];
        let n = f.peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"echo: abc\n");
        f.token.cancel();
    }
}
