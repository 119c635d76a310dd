//! tcp-comms: bidirectional newline-delimited TCP messaging.
//!
//! A listener accepts connections and each connection runs two tasks: a
//! receive loop that turns bytes into text messages, and a liveness probe
//! that ends the connection when the socket stops being writable. A dialer
//! opens the other end.
//!
//! Modules:
//! - `net`: connections, listener, dialer
//! - `channel`: framing, receive loop and `send`
//! - `supervisor`: lifecycle state machine, probe, session wiring
//! - `event`: the presentation-layer boundary (`EventSink`)
//! - `relay`: reply policy for received messages
//! - `server` / `client`: process-level orchestration
//! - `config`: CLI and TOML configuration

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod net;
pub mod relay;
pub mod server;
pub mod supervisor;

pub use channel::{Framing, MessageChannel};
pub use error::{
    AcceptError, BindError, ChannelError, ClientError, ConfigError, ConnectError, EndpointError,
    ServerError,
};
pub use event::{
    ChannelSink, DisconnectReason, EventSink, LifecycleEvent, LogSink, PeerInfo, SessionEvent,
    Side, TextMessage,
};
pub use net::{Connection, Dialer, Listener};
pub use relay::{Greeting, Responder};
pub use server::Server;
pub use supervisor::{ConnectionSupervisor, Lifecycle, LinkState, Session, SessionSettings};
