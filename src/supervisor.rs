//! Connection lifecycle and liveness supervision.
//!
//! Every channel moves through `Idle -> Connected -> Disconnected`.
//! [`Lifecycle`] owns that state and is the only path to the event sink, so
//! `Connected` is emitted once before any message, and nothing is emitted
//! after the single `Disconnected`.
//!
//! [`ConnectionSupervisor`] probes the socket on a fixed interval because a
//! peer that vanished silently may never surface on the read path.
//!
//! [`Session`] wires a connection, its channel and its supervisor together
//! and spawns the receive and probe tasks on a caller-owned tracker.

use crate::channel::{Framing, MessageChannel};
use crate::error::{is_remote_reset, ChannelError};
use crate::event::{notify, DisconnectReason, EventSink, LifecycleEvent, LogSink, PeerInfo, Side};
use crate::net::Connection;
use crate::relay::Responder;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connected,
    Disconnected,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LinkState::Idle,
            1 => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }
}

/// Lifecycle state plus the sink it gates.
pub struct Lifecycle {
    peer: PeerInfo,
    sink: Arc<dyn EventSink>,
    state: AtomicU8,
    /// Serializes transitions and deliveries.
    gate: Mutex<()>,
    finished: CancellationToken,
}

impl Lifecycle {
    pub fn new(peer: PeerInfo, sink: Arc<dyn EventSink>) -> Self {
        Self {
            peer,
            sink,
            state: AtomicU8::new(LinkState::Idle as u8),
            gate: Mutex::new(()),
            finished: CancellationToken::new(),
        }
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Resolves once `Disconnected` has been emitted.
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }

    /// `Idle -> Connected`. Returns the emitted event, if any.
    pub fn connect(&self) -> Option<LifecycleEvent> {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state() != LinkState::Idle {
            return None;
        }

        self.state.store(LinkState::Connected as u8, Ordering::Release);
        notify(&self.peer, || self.sink.on_connected(&self.peer));
        Some(LifecycleEvent::Connected)
    }

    /// Move to the terminal state.
    ///
    /// Emits `Disconnected` only for the first call after `Connected`; a
    /// channel that never connected ends silently.
    pub fn disconnect(&self, reason: DisconnectReason) -> Option<LifecycleEvent> {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.state();
        if previous == LinkState::Disconnected {
            return None;
        }

        self.state
            .store(LinkState::Disconnected as u8, Ordering::Release);
        self.finished.cancel();
        if previous != LinkState::Connected {
            return None;
        }

        info!(peer_id = %self.peer.id, side = %self.peer.side, %reason, "Connection closed");
        notify(&self.peer, || self.sink.on_disconnected(&self.peer, &reason));
        Some(LifecycleEvent::Disconnected)
    }

    /// Call the sink only while `Connected`. Returns whether it was called.
    pub fn deliver(&self, event: impl FnOnce(&dyn EventSink, &PeerInfo)) -> bool {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state() != LinkState::Connected {
            return false;
        }

        notify(&self.peer, || event(self.sink.as_ref(), &self.peer));
        true
    }
}

/// Watches a connection and ends its lifecycle when it stops being writable.
pub struct ConnectionSupervisor {
    conn: Arc<Connection>,
    lifecycle: Arc<Lifecycle>,
    probe_interval: Duration,
}

impl ConnectionSupervisor {
    pub fn new(conn: Arc<Connection>, lifecycle: Arc<Lifecycle>, probe_interval: Duration) -> Self {
        Self {
            conn,
            lifecycle,
            probe_interval,
        }
    }

    /// Enter `Connected` and emit the event.
    pub fn start(&self) -> Option<LifecycleEvent> {
        self.lifecycle.connect()
    }

    /// Probe writability every interval until the connection closes.
    ///
    /// The first failed probe emits `Disconnected` and closes the connection.
    pub async fn probe_loop(&self) {
        let start = Instant::now() + self.probe_interval;
        let mut interval = tokio::time::interval_at(start, self.probe_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.conn.closed() => break,
                _ = interval.tick() => {}
            }

            // Whoever closed it reports the reason.
            if self.conn.is_closed() || self.lifecycle.state() == LinkState::Disconnected {
                break;
            }

            if let Err(e) = self.conn.check_writable() {
                // A reset is reported the same way the read path would have.
                let reason = if is_remote_reset(&e) {
                    DisconnectReason::RemoteReset
                } else {
                    DisconnectReason::ProbeFailed
                };
                warn!(
                    peer = %self.conn.peer_addr(),
                    peer_id = %self.lifecycle.peer().id,
                    error = %e,
                    "Liveness probe failed"
                );
                self.lifecycle.disconnect(reason);
                self.conn.close().await;
                break;
            }
        }

        debug!(peer_id = %self.lifecycle.peer().id, "Probe loop stopped");
    }
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Size of each socket read.
    pub buffer_size: usize,
    /// Delay between writability probes.
    pub probe_interval: Duration,
    pub framing: Framing,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            probe_interval: Duration::from_secs(1),
            framing: Framing::Line,
        }
    }
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    peer: PeerInfo,
    settings: SessionSettings,
    sink: Arc<dyn EventSink>,
    responder: Option<Arc<dyn Responder>>,
}

impl SessionBuilder {
    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn responder(mut self, responder: Option<Arc<dyn Responder>>) -> Self {
        self.responder = responder;
        self
    }

    /// Emit `Connected`, then spawn the receive and probe tasks on `tracker`.
    pub fn start(self, conn: Connection, tracker: &TaskTracker) -> Session {
        let conn = Arc::new(conn);
        let lifecycle = Arc::new(Lifecycle::new(self.peer, self.sink));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::clone(&conn),
            Arc::clone(&lifecycle),
            self.settings.probe_interval,
        ));
        let channel = Arc::new(
            MessageChannel::new(conn, Arc::clone(&lifecycle), &self.settings)
                .with_responder(self.responder),
        );

        supervisor.start();

        let receiver = Arc::clone(&channel);
        tracker.spawn(async move {
            if let Err(e) = receiver.receive_loop().await {
                warn!(peer_id = %receiver.peer().id, error = %e, "Receive loop failed to start");
            }
        });

        let prober = Arc::clone(&supervisor);
        tracker.spawn(async move { prober.probe_loop().await });

        Session { channel, lifecycle }
    }
}

/// Handle to a running connection.
#[derive(Clone)]
pub struct Session {
    channel: Arc<MessageChannel>,
    lifecycle: Arc<Lifecycle>,
}

impl Session {
    pub fn builder(side: Side, peer_id: impl Into<String>) -> SessionBuilder {
        SessionBuilder {
            peer: PeerInfo {
                id: peer_id.into(),
                side,
            },
            settings: SessionSettings::default(),
            sink: Arc::new(LogSink),
            responder: None,
        }
    }

    pub fn peer(&self) -> &PeerInfo {
        self.lifecycle.peer()
    }

    pub fn state(&self) -> LinkState {
        self.lifecycle.state()
    }

    pub fn channel(&self) -> &Arc<MessageChannel> {
        &self.channel
    }

    /// Send one line of text. See [`MessageChannel::send`].
    pub async fn send(&self, text: &str) -> Result<(), ChannelError> {
        self.channel.send(text).await
    }

    /// Close from this side. Emits `Disconnected` unless already emitted.
    pub async fn close(&self) {
        self.lifecycle.disconnect(DisconnectReason::LocalClose);
        self.channel.connection().close().await;
    }

    /// Resolves once `Disconnected` has been emitted.
    pub async fn finished(&self) {
        self.lifecycle.finished().await
    }
}
