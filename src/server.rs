//! TCP server: binds the listener, runs the accept loop and supervises one
//! session per accepted connection.

use crate::config::Config;
use crate::error::{BindError, ServerError};
use crate::event::{EventSink, LogSink, Side};
use crate::net::Listener;
use crate::relay::{Greeting, Responder};
use crate::supervisor::Session;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;
use uuid::Uuid;

/// Server instance
pub struct Server {
    config: Config,
    sink: Arc<dyn EventSink>,
    responder: Option<Arc<dyn Responder>>,
}

impl Server {
    /// Create a new server instance.
    ///
    /// Events go to the log and, unless `config.reply` is off, every message
    /// is answered with the greeting.
    pub fn new(config: Config) -> Self {
        let responder: Option<Arc<dyn Responder>> = if config.reply {
            Some(Arc::new(Greeting))
        } else {
            None
        };

        Server {
            config,
            sink: Arc::new(LogSink),
            responder,
        }
    }

    /// Route session events to `sink` instead of the log.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the reply policy.
    pub fn with_responder(mut self, responder: Option<Arc<dyn Responder>>) -> Self {
        self.responder = responder;
        self
    }

    /// Bind the configured address. Fails before any accept is attempted.
    pub fn bind(&self) -> Result<Listener, BindError> {
        let listener = Listener::bind(&self.config.host, self.config.port)?
            .with_keepalive(self.config.keepalive)
            .with_connection_limit(self.config.max_connections);
        Ok(listener)
    }

    /// Bind and serve until `cancel` is raised.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener, cancel).await
    }

    /// Serve connections from an already bound listener.
    ///
    /// Returns once the accept loop has stopped and every session task has
    /// finished.
    pub async fn serve(&self, listener: Listener, cancel: CancellationToken) -> Result<(), ServerError> {
        let sessions = cancel.child_token();
        let tracker = TaskTracker::new();
        let settings = self.config.session_settings();

        let result = listener
            .accept_loop(&sessions, &tracker, |conn| {
                let peer_id = Uuid::new_v4().to_string();
                info!(peer = %conn.peer_addr(), %peer_id, "Connection established");

                let builder = Session::builder(Side::Acceptor, peer_id)
                    .settings(settings.clone())
                    .sink(Arc::clone(&self.sink))
                    .responder(self.responder.clone());
                let tracker = tracker.clone();

                async move {
                    let session = builder.start(conn, &tracker);
                    session.finished().await;
                }
            })
            .await;

        // Stop every session, including after a fatal accept error.
        sessions.cancel();
        tracker.close();
        tracker.wait().await;
        info!(address = %listener.local_addr(), "Server stopped");

        Ok(result?)
    }
}
