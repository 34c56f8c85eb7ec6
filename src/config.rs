//! Configuration module for the nectarine acceptor.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// How the reply to a request is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// Answer every request with the configured reply.
    Fixed,
    /// Answer every request with its own bytes.
    Echo,
}

/// Command-line arguments for the acceptor
#[derive(Parser, Debug)]
#[command(name = "nectarine")]
#[command(version = "0.1.0")]
#[command(about = "A readiness-driven TCP request/response server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0 or ::1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog (defaults to SOMAXCONN)
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Number of handler worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Dispatches that may wait for a free worker before backpressure applies
    #[arg(long)]
    pub queue_depth: Option<usize>,

    /// Maximum number of open connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Close each connection after its first reply
    #[arg(long)]
    pub close_after_reply: bool,

    /// Response mode
    #[arg(long, value_enum)]
    pub mode: Option<ResponseMode>,

    /// Fixed reply; accepts \r, \n, \t and \\ escapes
    #[arg(long)]
    pub reply: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub response: ResponseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and dispatcher configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: Option<u16>,
    pub backlog: Option<i32>,
    pub workers: Option<usize>,
    pub queue_depth: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum readiness events returned by a single wait
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            backlog: None,
            workers: None,
            queue_depth: None,
            max_connections: default_max_connections(),
            batch_size: default_batch_size(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default)]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub close_after_reply: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            write_timeout_ms: default_write_timeout_ms(),
            idle_timeout_secs: 0,
            close_after_reply: false,
        }
    }
}

/// Response configuration
#[derive(Debug, Deserialize)]
pub struct ResponseConfig {
    #[serde(default = "default_mode")]
    pub mode: ResponseMode,
    #[serde(default = "default_reply")]
    pub reply: String,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            reply: default_reply(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    1024
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_buffer_size() -> usize {
    16 * 1024 // 16 KB
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_mode() -> ResponseMode {
    ResponseMode::Fixed
}

fn default_reply() -> String {
    "+PONG\r\n".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub workers: usize,
    pub queue_depth: usize,
    pub max_connections: usize,
    pub batch_size: usize,
    pub shutdown_grace: Duration,
    pub buffer_size: usize,
    pub write_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub close_after_reply: bool,
    pub mode: ResponseMode,
    pub reply: Vec<u8>,
    pub log_level: String,
}

impl Default for Config {
    /// Defaults with port 0, which binds an ephemeral port.
    fn default() -> Self {
        let workers = default_workers();
        Self {
            host: default_host(),
            port: 0,
            backlog: libc::SOMAXCONN,
            workers,
            queue_depth: workers * 4,
            max_connections: default_max_connections(),
            batch_size: default_batch_size(),
            shutdown_grace: Duration::from_millis(default_shutdown_grace_ms()),
            buffer_size: default_buffer_size(),
            write_timeout: Duration::from_millis(default_write_timeout_ms()),
            idle_timeout: None,
            close_after_reply: false,
            mode: default_mode(),
            reply: default_reply().into_bytes(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values over defaults.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let port = cli
            .port
            .or(toml_config.server.port)
            .ok_or(ConfigError::MissingPort)?;

        let workers = cli
            .workers
            .or(toml_config.server.workers)
            .filter(|&w| w > 0)
            .unwrap_or_else(default_workers);

        let queue_depth = cli
            .queue_depth
            .or(toml_config.server.queue_depth)
            .unwrap_or(workers * 4)
            .max(1);

        let idle_secs = cli
            .idle_timeout
            .unwrap_or(toml_config.connection.idle_timeout_secs);

        let reply = match cli.reply {
            Some(raw) => unescape(&raw),
            None => toml_config.response.reply.into_bytes(),
        };

        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port,
            backlog: cli
                .backlog
                .or(toml_config.server.backlog)
                .unwrap_or(libc::SOMAXCONN),
            workers,
            queue_depth,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            batch_size: toml_config.server.batch_size.max(1),
            shutdown_grace: Duration::from_millis(toml_config.server.shutdown_grace_ms),
            buffer_size: toml_config.connection.buffer_size.max(1),
            write_timeout: Duration::from_millis(toml_config.connection.write_timeout_ms),
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            close_after_reply: cli.close_after_reply || toml_config.connection.close_after_reply,
            mode: cli.mode.unwrap_or(toml_config.response.mode),
            reply,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        // Surface a bad host at startup rather than at bind time.
        config.listen_addr()?;
        Ok(config)
    }

    /// The socket address to bind.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.host.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Expand the escapes a shell makes awkward to type.
fn unescape(raw: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('r') => out.push(b'\r'),
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('\\') => out.push(b'\\'),
            Some(other) => {
                out.push(b'\\');
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
            None => out.push(b'\\'),
        }
    }
    out
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("No listen port given (use --port or server.port)")]
    MissingPort,

    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["nectarine"];
        argv.extend_from_slice(args);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, None);
        assert_eq!(config.connection.buffer_size, 16 * 1024);
        assert_eq!(config.response.mode, ResponseMode::Fixed);
        assert_eq!(config.response.reply, "+PONG\r\n");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 7070
            backlog = 128
            workers = 4
            queue_depth = 8

            [connection]
            idle_timeout_secs = 30
            close_after_reply = true

            [response]
            mode = "echo"
            reply = "OK\r\n"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, Some(7070));
        assert_eq!(config.server.backlog, Some(128));
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.connection.idle_timeout_secs, 30);
        assert!(config.connection.close_after_reply);
        assert_eq!(config.response.mode, ResponseMode::Echo);
        assert_eq!(config.response.reply, "OK\r\n");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_port_required() {
        let err = Config::merge(cli(&[]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPort));
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            workers = 2

            [connection]
            idle_timeout_secs = 10
            "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["-p", "7070", "--workers", "3", "--reply", "+OK\\r\\n"]),
            toml_config,
        )
        .unwrap();

        assert_eq!(config.port, 7070);
        assert_eq!(config.workers, 3);
        assert_eq!(config.queue_depth, 12);
        assert_eq!(config.backlog, libc::SOMAXCONN);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.reply, b"+OK\r\n");
        assert_eq!(
            config.listen_addr().unwrap(),
            "0.0.0.0:7070".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_zero_queue_depth_raised() {
        let config = Config::merge(cli(&["-p", "7070", "--queue-depth", "0"]), TomlConfig::default())
            .unwrap();
        assert_eq!(config.queue_depth, 1);
    }

    #[test]
    fn test_invalid_host_rejected() {
        let err = Config::merge(cli(&["-p", "1", "--host", "not an ip"]), TomlConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress(_)));
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("+PONG\\r\\n"), b"+PONG\r\n");
        assert_eq!(unescape("a\\\\b\\q"), b"a\\b\\q");
        assert_eq!(unescape("tail\\"), b"tail\\");
    }
}
