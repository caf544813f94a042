//! Client runtime for the xgrpc request/push protocol.
//!
//! The SDK keeps one streaming connection per RPC client to one of a pool of
//! backend servers, moves it to another server when the current one fails or
//! the server asks for it, and dispatches server-initiated pushes to handlers.
//!
//! # Features
//!
//! - **Server discovery**: static server lists or a discovery endpoint polled in the background
//! - **Failover**: round-robin selection, HTTP failover across servers, signed requests
//! - **Asynchronous switching**: at most one server switch per client, new connection before old close
//! - **Push handling**: typed handlers per message type, with reset and liveness built in
//! - **Observability**: `tracing` events everywhere, pluggable request metrics
//!
//! # Quick Start
//!
//! ```no_run
//! use std::{collections::HashMap, time::Duration};
//!
//! use xgrpc_sdk::{ClientConfig, HealthCheckRequest, RpcClientManager, ServerConfig};
//!
//! # async fn example() -> xgrpc_sdk::Result<()> {
//! let manager = RpcClientManager::builder()
//!     .client_config(ClientConfig::builder().app_name("demo").build()?)
//!     .server_configs(vec![ServerConfig::builder().ip_addr("127.0.0.1").port(8848).build()?])
//!     .build()
//!     .await?;
//!
//! let client = manager.get_rpc_client(HashMap::new(), Vec::new()).await?;
//! let mut request = HealthCheckRequest::default();
//! let response = manager.request(&client, &mut request, Duration::from_secs(3)).await?;
//! assert!(response.base().is_success());
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 RpcClientManager (Public API)               │
//! │   client cache │ header injection │ request metrics         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                        RpcClient                            │
//! │   state machine │ switch task │ health check │ push loop    │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │       ServerRegistry         │     PushHandlerRegistry      │
//! │  discovery │ round-robin     │  ConnectReset │ Detection    │
//! │  failover │ signing          │  custom handlers             │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │                   StreamingConnection                       │
//! │   handshake │ unary calls │ push stream │ abandonment       │
//! ├─────────────────────────────────────────────────────────────┤
//! │              Connector / Transport (tonic gRPC)             │
//! │   /Request/request │ /BiRequestStream/requestBiStream       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod connection;
mod error;
mod handler;
mod http;
mod manager;
mod message;
mod metrics;
pub mod mock;
mod retry;
mod security;
mod server;
mod transport;

/// Version string reported to servers in the connection setup and HTTP headers.
pub const CLIENT_VERSION: &str = concat!("xgrpc-rust-sdk:v", env!("CARGO_PKG_VERSION"));

// Public API exports
pub use client::{ClientEvent, ClientState, HEALTH_CHECK_TIMEOUT, RpcClient};
pub use config::{
    ClientConfig, DEFAULT_CONTEXT_PATH, DEFAULT_SCHEME, DEFAULT_SERVER_PORT, GRPC_PORT_OFFSET,
    RetryPolicy, ServerConfig, detect_local_ip,
};
pub use connection::StreamingConnection;
pub use error::{Result, SdkError};
pub use handler::{
    ClientDetectionHandler, ConnectResetHandler, PushHandlerEntry, PushHandlerRegistry,
    ServerRequestHandler,
};
pub use http::{HttpAgent, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpAgent};
pub use manager::{
    CHARSET_HEADER, CLIENT_APPNAME_HEADER, CLIENT_REQUEST_TOKEN_HEADER, CLIENT_REQUEST_TS_HEADER,
    EX_CONFIG_INFO_HEADER, LABEL_MODULE, LABEL_SOURCE, LABEL_TASK_ID, RpcClientManager,
};
pub use message::{
    ClientDetectionRequest, ClientDetectionResponse, ConnectResetRequest, ConnectResetResponse,
    ConnectionSetupRequest, ErrorResponse, HealthCheckRequest, HealthCheckResponse,
    RESPONSE_CODE_FAIL, RESPONSE_CODE_SUCCESS, RequestBase, RequestMessage, ResponseBase,
    ResponseMessage, ResponseRegistry, RpcRequest, RpcResponse, ServerCheckRequest,
    ServerCheckResponse, decode_request, encode_request, encode_response,
};
pub use metrics::{ConnectionEvent, MetricsRequestMetrics, NoopRequestMetrics, RequestMetrics};
pub use retry::{with_retry, with_retry_cancellable};
pub use security::{
    ACCESS_KEY_HEADER, ACCESS_TOKEN_PARAM, NoopSecurityProvider, SIGNATURE_HEADER,
    SecurityProvider, StaticSecurityProvider, TIMESTAMP_HEADER, hmac_sha1_base64, request_token,
    sign, sign_headers, sign_resource,
};
pub use server::{
    SERVER_LIST_PATH, SINGLE_SERVER_RETRY_TIMES, ServerDescriptor, ServerRegistry,
    parse_server_list, server_list_url,
};
pub use transport::{Connected, Connector, GrpcConnector, PushStream, Transport};
// Re-export the wire envelope so custom transports can be written.
pub use xgrpc_proto::proto::{Metadata, Payload};
