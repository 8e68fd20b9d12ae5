//! Server configuration.
//!
//! Loaded from a TOML file. Every section except `[tls]` has defaults, so a
//! minimal configuration only names the certificate and key.

use crate::error::ConfigError;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Example configuration printed by `--print-config`.
pub const DEFAULT_CONFIG: &str = r#"# shroud configuration

[server]
host = "localhost"
port = 8443
# readiness wait timeout
selector_timeout_ms = 1000
# unfinished handshakes are dropped after this long
handshake_timeout_ms = 10000
# a blocked write may wait this long for the socket to drain
io_timeout_ms = 10000
# decoded payloads waiting for a worker
read_queue_capacity = 500
# responses waiting per peer
write_queue_capacity = 1000
# serialize dispatch per connection
ordered_dispatch = true
# payloads held per connection before reading pauses
backlog_capacity = 64

[workers]
# threads = 4
task_threads = 2

[processor]
path = "processor.tmpl"
refresh_interval_ms = 5000

[tls]
cert = "server.crt"
key = "server.key"
# require client certificates issued by these CAs
# trust = "ca.crt"
delegate_handshake = true

[logging]
level = "info"
format = "pretty"
timestamps = true
thread_names = true
target = false
"#;

/// Server configuration loaded from TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listener and queue settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Thread pool sizes
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Processor definition
    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Certificate, key and optional client trust store
    pub tls: TlsConfig,

    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and queue settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Readiness wait timeout in milliseconds
    #[serde(default = "default_selector_timeout_ms")]
    pub selector_timeout_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// How long a blocked write may wait for the socket to drain
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// Capacity of the global queue of decoded payloads
    #[serde(default = "default_read_queue_capacity")]
    pub read_queue_capacity: usize,

    /// Capacity of each peer's response queue
    #[serde(default = "default_write_queue_capacity")]
    pub write_queue_capacity: usize,

    /// Keep at most one payload per connection in flight
    #[serde(default = "default_true")]
    pub ordered_dispatch: bool,

    /// Payloads held back per connection under ordered dispatch
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            selector_timeout_ms: default_selector_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            read_queue_capacity: default_read_queue_capacity(),
            write_queue_capacity: default_write_queue_capacity(),
            ordered_dispatch: true,
            backlog_capacity: default_backlog_capacity(),
        }
    }
}

/// Worker thread configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of dispatch threads (default: available parallelism)
    pub threads: Option<usize>,

    /// Number of threads running delegated handshake tasks
    #[serde(default = "default_task_threads")]
    pub task_threads: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            threads: None,
            task_threads: default_task_threads(),
        }
    }
}

/// Processor definition configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessorConfig {
    /// Path to the template file
    #[serde(default = "default_processor_path")]
    pub path: PathBuf,

    /// How often to check the file for changes
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            path: default_processor_path(),
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

/// TLS credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert: PathBuf,

    /// PEM private key
    pub key: PathBuf,

    /// PEM trust anchors for client certificates. Enables client auth.
    #[serde(default)]
    pub trust: Option<PathBuf>,

    /// Run handshake record processing on the task pool
    #[serde(default = "default_true")]
    pub delegate_handshake: bool,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "default_true")]
    pub timestamps: bool,

    #[serde(default = "default_true")]
    pub thread_names: bool,

    /// Include the event target (module path)
    #[serde(default)]
    pub target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            thread_names: true,
            target: false,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8443
}

fn default_selector_timeout_ms() -> u64 {
    1000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_io_timeout_ms() -> u64 {
    10_000
}

fn default_read_queue_capacity() -> usize {
    500
}

fn default_write_queue_capacity() -> usize {
    1000
}

fn default_backlog_capacity() -> usize {
    64
}

fn default_task_threads() -> usize {
    2
}

fn default_processor_path() -> PathBuf {
    PathBuf::from("processor.tmpl")
}

fn default_refresh_interval_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.is_empty() {
            return Err(ConfigError::Invalid("server.host must not be empty".into()));
        }
        if self.server.read_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "server.read_queue_capacity must be at least 1".into(),
            ));
        }
        if self.server.write_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "server.write_queue_capacity must be at least 1".into(),
            ));
        }
        if self.server.backlog_capacity == 0 {
            return Err(ConfigError::Invalid(
                "server.backlog_capacity must be at least 1".into(),
            ));
        }
        if self.server.handshake_timeout_ms == 0 || self.server.io_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "server timeouts must be greater than zero".into(),
            ));
        }
        if self.workers.threads == Some(0) {
            return Err(ConfigError::Invalid("workers.threads must be at least 1".into()));
        }
        if self.processor.refresh_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "processor.refresh_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Number of dispatch worker threads.
    pub fn threads(&self) -> usize {
        self.workers.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Resolve `host:port` to the listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = (self.server.host.as_str(), self.server.port);
        host.to_socket_addrs()
            .map_err(|e| ConfigError::Invalid(format!("cannot resolve {}: {e}", self.server.host)))?
            .next()
            .ok_or_else(|| {
                ConfigError::Invalid(format!("{} resolved to no addresses", self.server.host))
            })
    }

    pub fn selector_timeout(&self) -> Duration {
        Duration::from_millis(self.server.selector_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.server.handshake_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.server.io_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.processor.refresh_interval_ms)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}
