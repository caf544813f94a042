//! Client and server configuration.
//!
//! Both structs deserialize from configuration files with serde (durations in
//! humantime format, e.g. `"10s"`) and can be built in code through fallible
//! builders that validate before returning:
//!
//! ```no_run
//! # use xgrpc_sdk::{ClientConfig, ServerConfig};
//! # fn example() -> xgrpc_sdk::Result<()> {
//! let server = ServerConfig::builder().ip_addr("127.0.0.1").port(8848).grpc_port(9848).build()?;
//! let client = ClientConfig::builder().app_name("demo").log_level("debug").build()?;
//! # Ok(())
//! # }
//! ```

use std::{net::UdpSocket, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::error::{ConfigInvalidSnafu, Result};

/// Default scheme for server addresses.
pub const DEFAULT_SCHEME: &str = "http";

/// Default web context path of the backend.
pub const DEFAULT_CONTEXT_PATH: &str = "/xgrpc";

/// Default HTTP port of a backend server.
pub const DEFAULT_SERVER_PORT: u16 = 8848;

/// Offset between a server's HTTP port and its gRPC port.
pub const GRPC_PORT_OFFSET: u16 = 1000;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// A statically configured backend server.
///
/// # Validation Rules
///
/// - `ip_addr` must not be empty
/// - `port` must be in `1..=65535`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host name or IP. May carry a scheme prefix (`https://host`), which then
    /// takes precedence over `scheme`.
    pub ip_addr: String,
    /// HTTP port.
    pub port: u16,
    /// Scheme used to build the server address.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Web context path prefixed to HTTP API paths.
    #[serde(default = "default_context_path")]
    pub context_path: String,
    /// Port of the gRPC endpoint; `port + 1000` when absent.
    #[serde(default)]
    pub grpc_port: Option<u16>,
}

#[bon::bon]
impl ServerConfig {
    /// Creates a validated server entry.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::ConfigInvalid`](crate::SdkError::ConfigInvalid) if
    /// the address is empty or the port is 0.
    #[builder]
    pub fn new(
        #[builder(into)] ip_addr: String,
        port: u16,
        #[builder(into, default = default_scheme())] scheme: String,
        #[builder(into, default = default_context_path())] context_path: String,
        grpc_port: Option<u16>,
    ) -> Result<Self> {
        let config = Self { ip_addr, port, scheme, context_path, grpc_port };
        config.validate()?;
        Ok(config)
    }
}

impl ServerConfig {
    /// Validates the entry.
    ///
    /// Call after deserialization.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::ConfigInvalid`](crate::SdkError::ConfigInvalid) on an
    /// empty address or a zero port.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.ip_addr.trim().is_empty(),
            ConfigInvalidSnafu { message: "server ip_addr must not be empty" }
        );
        ensure!(
            self.port > 0,
            ConfigInvalidSnafu { message: format!("invalid port {} for {}", self.port, self.ip_addr) }
        );
        Ok(())
    }
}

/// Client-wide settings shared by every RPC client a manager creates.
///
/// # Validation Rules
///
/// - `timeout`, `keep_alive_interval` and `connect_timeout` must be non-zero
/// - `log_level` must be one of `trace`, `debug`, `info`, `warn`, `error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Namespace (tenant) the clients operate in.
    #[serde(default)]
    pub namespace_id: String,
    /// Application name sent with every request.
    #[serde(default)]
    pub app_name: String,
    /// Application key; feeds the per-request token digest.
    #[serde(default)]
    pub app_key: String,
    /// Access key for signed HTTP calls.
    #[serde(default)]
    pub access_key: Option<String>,
    /// Secret key for signed HTTP calls.
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Discovery endpoint (`host:port`) serving the server list.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Context path applied to servers learned through discovery.
    #[serde(default = "default_context_path")]
    pub context_path: String,
    /// Default timeout for requests and discovery calls.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Idle time after which a health check probes the connection.
    #[serde(default = "default_keep_alive_interval", with = "humantime_serde")]
    pub keep_alive_interval: Duration,
    /// Timeout for establishing a transport connection.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Minimum interval between two discovery fetches.
    #[serde(default = "default_server_refresh_interval", with = "humantime_serde")]
    pub server_refresh_interval: Duration,
    /// Address reported to the server in every envelope.
    #[serde(default = "detect_local_ip")]
    pub client_ip: String,
    /// Directory for on-disk caches.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Directory for log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Log level used when no `RUST_LOG` filter is set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Retry policy for establishing the first connection.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

#[bon::bon]
impl ClientConfig {
    /// Creates a validated client configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::ConfigInvalid`](crate::SdkError::ConfigInvalid) if a
    /// duration is zero or the log level is unknown.
    #[builder]
    pub fn new(
        #[builder(into, default)] namespace_id: String,
        #[builder(into, default)] app_name: String,
        #[builder(into, default)] app_key: String,
        access_key: Option<String>,
        secret_key: Option<String>,
        endpoint: Option<String>,
        #[builder(into, default = default_context_path())] context_path: String,
        #[builder(default = default_timeout())] timeout: Duration,
        #[builder(default = default_keep_alive_interval())] keep_alive_interval: Duration,
        #[builder(default = default_connect_timeout())] connect_timeout: Duration,
        #[builder(default = default_server_refresh_interval())] server_refresh_interval: Duration,
        #[builder(into, default = detect_local_ip())] client_ip: String,
        #[builder(into, default = default_cache_dir())] cache_dir: PathBuf,
        #[builder(into, default = default_log_dir())] log_dir: PathBuf,
        #[builder(into, default = default_log_level())] log_level: String,
        #[builder(default)] retry_policy: RetryPolicy,
    ) -> Result<Self> {
        let config = Self {
            namespace_id,
            app_name,
            app_key,
            access_key,
            secret_key,
            endpoint,
            context_path,
            timeout,
            keep_alive_interval,
            connect_timeout,
            server_refresh_interval,
            client_ip,
            cache_dir,
            log_dir,
            log_level,
            retry_policy,
        };
        config.validate()?;
        Ok(config)
    }
}

impl ClientConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::ConfigInvalid`](crate::SdkError::ConfigInvalid) if any
    /// value is out of range.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.timeout.is_zero(), ConfigInvalidSnafu { message: "timeout must be > 0" });
        ensure!(
            !self.keep_alive_interval.is_zero(),
            ConfigInvalidSnafu { message: "keep_alive_interval must be > 0" }
        );
        ensure!(
            !self.connect_timeout.is_zero(),
            ConfigInvalidSnafu { message: "connect_timeout must be > 0" }
        );
        ensure!(
            LOG_LEVELS.contains(&self.log_level.as_str()),
            ConfigInvalidSnafu { message: format!("unknown log level '{}'", self.log_level) }
        );
        self.retry_policy.validate()
    }

    /// Returns the discovery endpoint when one is configured and non-blank.
    #[must_use]
    pub fn discovery_endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namespace_id: String::new(),
            app_name: String::new(),
            app_key: String::new(),
            access_key: None,
            secret_key: None,
            endpoint: None,
            context_path: default_context_path(),
            timeout: default_timeout(),
            keep_alive_interval: default_keep_alive_interval(),
            connect_timeout: default_connect_timeout(),
            server_refresh_interval: default_server_refresh_interval(),
            client_ip: detect_local_ip(),
            cache_dir: default_cache_dir(),
            log_dir: default_log_dir(),
            log_level: default_log_level(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Backoff policy for establishing a client's first connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    #[builder(default = default_max_attempts())]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    #[builder(default = default_initial_backoff())]
    pub initial_backoff: Duration,
    /// Upper bound on the delay between retries.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    #[builder(default = default_max_backoff())]
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::ConfigInvalid`](crate::SdkError::ConfigInvalid) if
    /// `max_attempts` is 0 or the initial backoff exceeds the maximum.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_attempts > 0,
            ConfigInvalidSnafu { message: "retry_policy.max_attempts must be > 0" }
        );
        ensure!(
            self.initial_backoff <= self.max_backoff,
            ConfigInvalidSnafu {
                message: format!(
                    "retry_policy.initial_backoff ({:?}) must not exceed max_backoff ({:?})",
                    self.initial_backoff, self.max_backoff
                )
            }
        );
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.to_owned()
}

fn default_context_path() -> String {
    DEFAULT_CONTEXT_PATH.to_owned()
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_keep_alive_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_server_refresh_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(1)
}

fn working_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn default_cache_dir() -> PathBuf {
    working_dir().join("cache")
}

fn default_log_dir() -> PathBuf {
    working_dir().join("log")
}

/// Best-effort discovery of the outbound interface address.
///
/// Connecting a UDP socket sends no packets; it only asks the OS to pick a route.
pub fn detect_local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_owned())
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
