//! Console client.
//!
//! Dials the configured server once and either exchanges a single message
//! (`--message`) or forwards stdin lines until EOF, Ctrl-C or disconnect.

use crate::config::Config;
use crate::error::{ChannelError, ClientError, ConnectError};
use crate::event::{
    ChannelSink, DisconnectReason, EventSink, PeerInfo, SessionEvent, Side, TextMessage,
};
use crate::net::{Connection, Dialer};
use crate::supervisor::Session;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Prints session events to the terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn on_connected(&self, peer: &PeerInfo) {
        println!("{} connected.", peer.side.opposite());
    }

    fn on_message(&self, _peer: &PeerInfo, message: &TextMessage) {
        println!("{message}");
    }

    fn on_disconnected(&self, peer: &PeerInfo, _reason: &DisconnectReason) {
        println!("{} disconnected.", peer.side.opposite());
    }

    fn on_error(&self, peer: &PeerInfo, message: &str) {
        eprintln!("Error processing {}: {message}", peer.side.opposite());
    }
}

/// Dial the configured server. Exactly one attempt is made.
pub async fn connect(config: &Config, cancel: &CancellationToken) -> Result<Connection, ConnectError> {
    Dialer::new()
        .with_timeout(config.connect_timeout)
        .with_keepalive(config.keepalive)
        .connect(&config.host, config.port, cancel)
        .await
}

/// Run the client until the session ends or `cancel` is raised.
pub async fn run(config: &Config, cancel: CancellationToken) -> Result<(), ClientError> {
    let conn = connect(config, &cancel).await?;
    info!(peer = %conn.peer_addr(), "Connection established");

    let peer_id = format!("{}:{}", config.host, config.port);
    let tracker = TaskTracker::new();

    let result = match &config.message {
        Some(text) => {
            let reply = exchange(conn, peer_id, text, config, &cancel, &tracker).await;
            match reply {
                Ok(Some(message)) => {
                    println!("Message received: \"{}\"", message.payload().trim());
                    Ok(())
                }
                Ok(None) => {
                    println!("Connection closed.");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        None => interactive(conn, peer_id, config, &cancel, &tracker).await,
    };

    tracker.close();
    tracker.wait().await;
    result
}

/// Send `text` and wait for the first message back.
///
/// Returns `None` if the connection ends first.
pub async fn exchange(
    conn: Connection,
    peer_id: String,
    text: &str,
    config: &Config,
    cancel: &CancellationToken,
    tracker: &TaskTracker,
) -> Result<Option<TextMessage>, ClientError> {
    let (sink, mut events) = ChannelSink::new();
    let session = Session::builder(Side::Initiator, peer_id)
        .settings(config.session_settings())
        .sink(Arc::new(sink))
        .start(conn, tracker);

    if let Err(e) = session.send(text).await {
        session.close().await;
        return Err(e.into());
    }

    let reply = loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break None,
            event = events.recv() => event,
        };
        match event {
            Some(SessionEvent::Message(message)) => break Some(message),
            Some(SessionEvent::Disconnected(_)) | None => break None,
            Some(_) => continue,
        }
    };

    session.close().await;
    Ok(reply)
}

async fn interactive(
    conn: Connection,
    peer_id: String,
    config: &Config,
    cancel: &CancellationToken,
    tracker: &TaskTracker,
) -> Result<(), ClientError> {
    let session = Session::builder(Side::Initiator, peer_id)
        .settings(config.session_settings())
        .sink(Arc::new(ConsoleSink))
        .start(conn, tracker);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let result = loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            _ = session.finished() => break Ok(()),
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => match session.send(&line).await {
                Ok(()) => {}
                Err(e @ ChannelError::InvalidPayload(_)) => eprintln!("{e}"),
                Err(e) => {
                    debug!(error = %e, "Send failed, ending session");
                    break Ok(());
                }
            },
            Ok(None) => break Ok(()),
            Err(e) => break Err(ClientError::Input(e)),
        }
    };

    session.close().await;
    result
}
