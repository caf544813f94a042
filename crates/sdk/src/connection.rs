//! One logical connection to one server.
//!
//! A [`StreamingConnection`] wraps a [`Transport`] and adds the protocol on
//! top of it:
//!
//! - **Handshake**: a `ServerCheckRequest` obtains the connection id, then a
//!   `ConnectionSetupRequest` is written onto the stream
//! - **Unary calls**: envelope encoding, per-call deadline, response decoding
//!   by declared type
//! - **Abandonment**: once closed, the connection refuses new calls while
//!   calls already in flight run to completion or timeout

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, info};
use xgrpc_proto::proto::Payload;

use crate::{
    error::{ConnectionAbandonedSnafu, ConnectionSnafu, Result, SdkError},
    message::{
        ConnectionSetupRequest, ErrorResponse, ResponseMessage, ResponseRegistry, RpcRequest,
        RpcResponse, ServerCheckRequest, ServerCheckResponse, encode_request,
    },
    server::ServerDescriptor,
    transport::{Connector, PushStream, Transport},
};

/// A live connection to one server.
#[derive(Debug)]
pub struct StreamingConnection {
    server: ServerDescriptor,
    connection_id: String,
    transport: Arc<dyn Transport>,
    responses: Arc<ResponseRegistry>,
    client_ip: String,
    abandoned: AtomicBool,
    last_active: Mutex<Instant>,
}

impl StreamingConnection {
    /// Connects to `server` and completes the handshake.
    ///
    /// Returns the connection together with its inbound push stream, which
    /// the caller is expected to drain.
    ///
    /// # Errors
    ///
    /// Returns the connector's error when the server is unreachable, and the
    /// handshake's error when the server check fails. The transport is
    /// released in both cases.
    pub async fn establish(
        connector: &dyn Connector,
        server: &ServerDescriptor,
        responses: Arc<ResponseRegistry>,
        client_ip: &str,
        setup: &ConnectionSetupRequest,
        timeout: Duration,
    ) -> Result<(Self, PushStream)> {
        let connected = connector.connect(server).await?;
        let mut connection = Self {
            server: server.clone(),
            connection_id: String::new(),
            transport: connected.transport,
            responses,
            client_ip: client_ip.to_owned(),
            abandoned: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
        };

        match connection.handshake(setup, timeout).await {
            Ok(connection_id) => {
                connection.connection_id = connection_id;
                info!(
                    server = %connection.server,
                    connection_id = %connection.connection_id,
                    "connection established"
                );
                Ok((connection, connected.pushes))
            },
            Err(e) => {
                connection.close().await;
                Err(e)
            },
        }
    }

    async fn handshake(&self, setup: &ConnectionSetupRequest, timeout: Duration) -> Result<String> {
        let check: ServerCheckResponse =
            self.request_unary(&ServerCheckRequest::default(), timeout).await?.downcast()?;
        if !check.base.is_success() || check.connection_id.is_empty() {
            return ConnectionSnafu {
                message: format!("server check against {} was rejected", self.server),
            }
            .fail();
        }
        self.send_push(encode_request(setup, &self.client_ip)?)?;
        Ok(check.connection_id)
    }

    /// Returns the server this connection talks to.
    #[must_use]
    pub fn server(&self) -> &ServerDescriptor {
        &self.server
    }

    /// Returns the id the server assigned during the handshake.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Returns the IP reported to the server in every envelope.
    #[must_use]
    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    /// Time since the last successful call on this connection.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// Sends a request and waits for the response, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// - [`SdkError::ConnectionAbandoned`] if the connection was closed
    /// - [`SdkError::Timeout`] if no response arrives in time
    /// - [`SdkError::UnsupportedResponseType`] if the response type is unknown
    /// - [`SdkError::ServerError`] if the server answered with an `ErrorResponse`
    /// - transport or RPC errors from the underlying call
    pub async fn request_unary(
        &self,
        request: &dyn RpcRequest,
        timeout: Duration,
    ) -> Result<Box<dyn RpcResponse>> {
        if self.is_abandoned() {
            return ConnectionAbandonedSnafu { server: self.server.to_string() }.fail();
        }
        let payload = encode_request(request, &self.client_ip)?;
        let response = match tokio::time::timeout(timeout, self.transport.unary(payload, timeout))
            .await
        {
            Ok(result) => result?,
            Err(_) => return Err(SdkError::timeout(timeout)),
        };
        *self.last_active.lock() = Instant::now();

        let response = self.responses.decode(request.request_type(), &response)?;
        if response.response_type() == ErrorResponse::TYPE {
            let base = response.base();
            return Err(SdkError::ServerError {
                error_code: base.error_code,
                message: base.message.clone().unwrap_or_default(),
            });
        }
        Ok(response)
    }

    /// Writes one envelope onto the bidirectional stream.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Connection`] if the stream is closed.
    pub fn send_push(&self, payload: Payload) -> Result<()> {
        self.transport.send(payload)
    }

    /// Marks the connection abandoned and releases the transport.
    ///
    /// Idempotent: only the first call closes the transport.
    pub async fn close(&self) {
        if self.abandoned.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.close().await;
        debug!(server = %self.server, connection_id = %self.connection_id, "connection closed");
    }
}
