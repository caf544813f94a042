//! SDK error types with recovery context.
//!
//! Errors fall into three groups:
//! - **Configuration errors**: Raised while building a manager or registry; fatal
//! - **Call errors**: Transport failures, timeouts, protocol mismatches on a single call
//! - **Lifecycle errors**: The client is not running or is being torn down
//!
//! [`SdkError::is_retryable`] classifies which failures a caller may retry.

use std::time::Duration;

use snafu::{Location, Snafu};
use tonic::Code;

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;

/// SDK error types with context-rich error messages.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SdkError {
    /// Client or server configuration is missing or invalid.
    #[snafu(display("Invalid configuration: {message}"))]
    ConfigInvalid {
        /// Error description.
        message: String,
    },

    /// No backend servers are known at call time.
    #[snafu(display("Server list is empty"))]
    EmptyServerList,

    /// Failed to establish a connection or the stream broke underneath it.
    #[snafu(display("Connection error at {location}: {message}"))]
    Connection {
        /// Error description.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Transport-level error (HTTP/2, TLS).
    #[snafu(display("Transport error at {location}: {source}"))]
    Transport {
        /// Underlying transport error.
        source: tonic::transport::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// gRPC call failed with a status code.
    #[snafu(display("RPC error (code={code:?}): {message}"))]
    Rpc {
        /// gRPC status code.
        code: Code,
        /// Error message from server.
        message: String,
    },

    /// Operation timed out.
    #[snafu(display("Operation timed out after {duration_ms}ms"))]
    Timeout {
        /// Timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// The server answered with a type that has no registered decoder.
    #[snafu(display("request:{request_type},unsupported response type:{response_type}"))]
    UnsupportedResponseType {
        /// Type name of the request that was sent.
        request_type: String,
        /// Type name the server answered with.
        response_type: String,
    },

    /// The client is not in the `Running` state.
    #[snafu(display("Client is not running (state: {state})"))]
    NotRunning {
        /// State observed when the call was refused.
        state: String,
    },

    /// The server answered with an `ErrorResponse`.
    #[snafu(display("server error (code={error_code}): {message}"))]
    ServerError {
        /// Application error code from the response.
        error_code: i32,
        /// Message from the response.
        message: String,
    },

    /// Another server switch is already in flight for this client.
    #[snafu(display("Server switch already in progress"))]
    SwitchInProgress,

    /// The connection was replaced and refuses new calls.
    #[snafu(display("Connection to {server} is abandoned"))]
    ConnectionAbandoned {
        /// Address of the abandoned connection's server.
        server: String,
    },

    /// A message body could not be encoded or decoded.
    #[snafu(display("Serialization error at {location}: {source}"))]
    Serialization {
        /// Underlying JSON error.
        source: serde_json::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// An HTTP call to the discovery/auth endpoint could not be completed.
    #[snafu(display("HTTP request to {url} failed: {message}"))]
    HttpRequest {
        /// Target URL.
        url: String,
        /// Failure description.
        message: String,
    },

    /// The discovery/auth endpoint answered with a non-200 status.
    #[snafu(display("[{status}] {body}"))]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Retry attempts exhausted.
    #[snafu(display("retry {attempts} times request failed: {last_error}"))]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Last error message before giving up.
        last_error: String,
    },

    /// Client is shutting down.
    #[snafu(display("Client shutting down"))]
    Shutdown,

    /// URL parsing error.
    #[snafu(display("Invalid URL '{url}': {message}"))]
    InvalidUrl {
        /// The invalid URL.
        url: String,
        /// Parse error description.
        message: String,
    },
}

impl SdkError {
    /// Builds a [`SdkError::Timeout`] for `duration`, saturating at `u64::MAX` milliseconds.
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Returns true if the error is transient and the operation should be retried.
    ///
    /// Retryable errors:
    /// - Connection, transport and timeout failures
    /// - `EmptyServerList`: the next discovery refresh may fill the list
    /// - `SwitchInProgress` and `ConnectionAbandoned`: a fresh connection is on its way
    /// - `UNAVAILABLE`, `DEADLINE_EXCEEDED` and `RESOURCE_EXHAUSTED` status codes
    ///
    /// Configuration, protocol and lifecycle errors are not retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Transport { .. } => true,
            Self::Timeout { .. } => true,
            Self::EmptyServerList => true,
            Self::SwitchInProgress => true,
            Self::ConnectionAbandoned { .. } => true,
            Self::HttpRequest { .. } => true,
            Self::Rpc { code, .. } => matches!(
                code,
                Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted
            ),
            Self::Http { status, .. } => *status >= 500,
            // Non-retryable
            Self::ConfigInvalid { .. } => false,
            Self::UnsupportedResponseType { .. } => false,
            Self::ServerError { .. } => false,
            Self::NotRunning { .. } => false,
            Self::Serialization { .. } => false,
            Self::RetryExhausted { .. } => false,
            Self::Shutdown => false,
            Self::InvalidUrl { .. } => false,
        }
    }

    /// Returns true if the failure means the current connection is unusable.
    ///
    /// The client schedules a background server switch when a call fails this way.
    #[must_use]
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Transport { .. } | Self::ConnectionAbandoned { .. } => {
                true
            },
            Self::Rpc { code, .. } => matches!(code, Code::Unavailable | Code::Unknown),
            _ => false,
        }
    }

    /// Returns the gRPC status code if this is an RPC error.
    #[must_use]
    pub fn code(&self) -> Option<Code> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Short, stable label used as the result code of failed calls in metrics.
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::ConfigInvalid { .. } => "config_invalid",
            Self::EmptyServerList => "empty_server_list",
            Self::Connection { .. } | Self::Transport { .. } => "transport_error",
            Self::Rpc { .. } => "rpc_error",
            Self::Timeout { .. } => "timeout",
            Self::UnsupportedResponseType { .. } => "unsupported_response_type",
            Self::ServerError { .. } => "server_error",
            Self::NotRunning { .. } => "not_running",
            Self::SwitchInProgress => "switch_in_progress",
            Self::ConnectionAbandoned { .. } => "connection_abandoned",
            Self::Serialization { .. } => "serialization",
            Self::HttpRequest { .. } | Self::Http { .. } => "http_error",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Shutdown => "shutdown",
            Self::InvalidUrl { .. } => "invalid_url",
        }
    }
}

impl From<tonic::transport::Error> for SdkError {
    fn from(source: tonic::transport::Error) -> Self {
        Self::Transport { source, location: Location::default() }
    }
}

impl From<tonic::Status> for SdkError {
    fn from(status: tonic::Status) -> Self {
        Self::Rpc { code: status.code(), message: status.message().to_owned() }
    }
}
