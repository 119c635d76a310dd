//! Configuration module for tcp-comms.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::channel::Framing;
use crate::error::ConfigError;
use crate::net::resolve_endpoint;
use crate::supervisor::SessionSettings;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Which endpoint this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Accept connections and relay replies.
    #[default]
    Server,
    /// Dial a server and exchange lines from stdin.
    Client,
}

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "tcp-comms")]
#[command(author = "tcp-comms authors")]
#[command(version = "0.1.0")]
#[command(about = "Bidirectional newline-delimited TCP messaging", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run as server or client
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// IP address to listen on (server) or dial (client)
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port
    #[arg(short, long)]
    pub port: Option<u32>,

    /// Milliseconds between liveness probes
    #[arg(long)]
    pub probe_interval_ms: Option<u64>,

    /// How inbound bytes are split into messages
    #[arg(long, value_enum)]
    pub framing: Option<Framing>,

    /// Client dial timeout in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Maximum number of concurrent sessions (server)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// TCP keepalive idle time in seconds, 0 disables it
    #[arg(long)]
    pub keepalive_secs: Option<u64>,

    /// Do not answer received messages with the server greeting
    #[arg(long)]
    pub no_reply: bool,

    /// Send a single message, print the first reply and exit (client)
    #[arg(long)]
    pub message: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind to or dial
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port
    #[serde(default = "default_port")]
    pub port: u32,
    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Answer each received message with the greeting
    #[serde(default = "default_reply")]
    pub reply: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            reply: default_reply(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct ClientConfig {
    /// Dial timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// Per-connection channel configuration
#[derive(Debug, Deserialize)]
pub struct ChannelConfig {
    /// Read buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Milliseconds between liveness probes
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Message framing
    #[serde(default)]
    pub framing: Framing,
    /// TCP keepalive idle time in seconds. Unset derives it from the probe
    /// interval, 0 disables keepalive.
    pub keepalive_secs: Option<u64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            probe_interval_ms: default_probe_interval_ms(),
            framing: Framing::default(),
            keepalive_secs: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u32 {
    8080
}

fn default_max_connections() -> usize {
    1024
}

fn default_reply() -> bool {
    true
}

fn default_buffer_size() -> usize {
    1024
}

fn default_probe_interval_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Keepalive idle time matching the probe interval, in whole seconds.
fn default_keepalive(probe_interval: Duration) -> Duration {
    Duration::from_secs(probe_interval.as_secs().max(1))
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub host: String,
    pub port: u32,
    pub max_connections: usize,
    pub reply: bool,
    pub connect_timeout: Option<Duration>,
    pub buffer_size: usize,
    pub probe_interval: Duration,
    pub framing: Framing,
    pub keepalive: Option<Duration>,
    pub message: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::parse_from(["tcp-comms"]), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let probe_interval = Duration::from_millis(
            cli.probe_interval_ms
                .unwrap_or(toml_config.channel.probe_interval_ms),
        );
        let keepalive = match cli.keepalive_secs.or(toml_config.channel.keepalive_secs) {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(default_keepalive(probe_interval)),
        };

        Config {
            mode: cli.mode.unwrap_or(toml_config.mode),
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            reply: !cli.no_reply && toml_config.server.reply,
            connect_timeout: cli
                .connect_timeout_ms
                .or(toml_config.client.connect_timeout_ms)
                .map(Duration::from_millis),
            buffer_size: toml_config.channel.buffer_size,
            probe_interval,
            framing: cli.framing.unwrap_or(toml_config.channel.framing),
            keepalive,
            message: cli.message,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Reject values that would only fail later at socket time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.probe_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "probe_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_connections == 0 || self.max_connections > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid {
                field: "max_connections",
                reason: format!("must be between 1 and {}", Semaphore::MAX_PERMITS),
            });
        }
        if let Some(message) = &self.message {
            if message.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "message",
                    reason: "must contain non-whitespace text".to_string(),
                });
            }
        }
        Ok(())
    }

    /// The validated socket address. Port 0 is only allowed when listening.
    pub fn endpoint(&self) -> Result<SocketAddr, ConfigError> {
        let allow_ephemeral = self.mode == Mode::Server;
        Ok(resolve_endpoint(&self.host, self.port, allow_ephemeral)?)
    }

    /// Per-connection settings shared by server and client sessions.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            buffer_size: self.buffer_size,
            probe_interval: self.probe_interval,
            framing: self.framing,
        }
    }
}
