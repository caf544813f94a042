//! Transport seam between connections and the network.
//!
//! A [`Connector`] opens one physical connection to a server and returns a
//! [`Transport`] for unary calls plus the inbound push stream. The default
//! [`GrpcConnector`] speaks the two gRPC services over tonic; tests plug in
//! [`MockConnector`](crate::mock::MockConnector) instead.

use std::{fmt, sync::Arc, time::Duration};

use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use snafu::ResultExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{
    Code,
    transport::{Channel, ClientTlsConfig, Endpoint},
};
use tracing::debug;
use xgrpc_proto::proto::{
    Payload, bi_request_stream_client::BiRequestStreamClient, request_client::RequestClient,
};

use crate::{
    error::{ConnectionSnafu, InvalidUrlSnafu, Result, SdkError, TransportSnafu},
    server::ServerDescriptor,
};

/// HTTP/2 keep-alive interval for idle connections.
const HTTP2_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// HTTP/2 keep-alive timeout.
const HTTP2_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP keepalive interval.
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Messages the server pushes over the bidirectional stream.
pub type PushStream = BoxStream<'static, Result<Payload>>;

/// One open physical connection.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Issues a unary call and waits for the response envelope.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Timeout`] when the deadline passes, and a transport
    /// or RPC error when the call fails.
    async fn unary(&self, payload: Payload, timeout: Duration) -> Result<Payload>;

    /// Writes one envelope onto the bidirectional stream.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Connection`] when the stream is closed.
    fn send(&self, payload: Payload) -> Result<()>;

    /// Closes the outbound half of the stream and releases the connection.
    async fn close(&self);
}

/// A freshly opened connection.
pub struct Connected {
    /// Handle for unary calls and stream writes.
    pub transport: Arc<dyn Transport>,
    /// Inbound push messages.
    pub pushes: PushStream,
}

impl fmt::Debug for Connected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connected").field("transport", &self.transport).finish_non_exhaustive()
    }
}

/// Opens connections to servers.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Connects to `server` and opens its bidirectional stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or refuses the stream.
    async fn connect(&self, server: &ServerDescriptor) -> Result<Connected>;
}

/// [`Connector`] backed by tonic channels.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    connect_timeout: Duration,
}

impl GrpcConnector {
    /// Creates a connector whose dials give up after `connect_timeout`.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn endpoint(&self, server: &ServerDescriptor) -> Result<Endpoint> {
        let url = server.grpc_endpoint();
        let tls = url.starts_with("https://");
        let mut endpoint = Endpoint::from_shared(url.clone())
            .map_err(|e| InvalidUrlSnafu { url, message: e.to_string() }.build())?;
        if tls {
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().with_native_roots())
                .context(TransportSnafu)?;
        }
        Ok(endpoint
            .connect_timeout(self.connect_timeout)
            .tcp_nodelay(true)
            .tcp_keepalive(Some(TCP_KEEPALIVE_INTERVAL))
            .http2_keep_alive_interval(HTTP2_KEEPALIVE_INTERVAL)
            .keep_alive_timeout(HTTP2_KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(true))
    }
}

#[async_trait::async_trait]
impl Connector for GrpcConnector {
    async fn connect(&self, server: &ServerDescriptor) -> Result<Connected> {
        let channel = self.endpoint(server)?.connect().await.context(TransportSnafu)?;

        let (outbound, rx) = mpsc::unbounded_channel();
        let response = BiRequestStreamClient::new(channel.clone())
            .request_bi_stream(UnboundedReceiverStream::new(rx))
            .await?;
        let pushes = response.into_inner().map(|item| item.map_err(SdkError::from)).boxed();
        debug!(server = %server, "bi-stream opened");

        let transport = GrpcTransport {
            server: server.to_string(),
            channel,
            outbound: Mutex::new(Some(outbound)),
        };
        Ok(Connected { transport: Arc::new(transport), pushes })
    }
}

#[derive(Debug)]
struct GrpcTransport {
    server: String,
    channel: Channel,
    outbound: Mutex<Option<mpsc::UnboundedSender<Payload>>>,
}

#[async_trait::async_trait]
impl Transport for GrpcTransport {
    async fn unary(&self, payload: Payload, timeout: Duration) -> Result<Payload> {
        let mut request = tonic::Request::new(payload);
        request.set_timeout(timeout);
        match RequestClient::new(self.channel.clone()).request(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(status) if status.code() == Code::DeadlineExceeded => {
                Err(SdkError::timeout(timeout))
            },
            Err(status) => Err(status.into()),
        }
    }

    fn send(&self, payload: Payload) -> Result<()> {
        let guard = self.outbound.lock();
        let Some(sender) = guard.as_ref() else {
            return ConnectionSnafu { message: format!("bi-stream to {} is closed", self.server) }
                .fail();
        };
        sender.send(payload).map_err(|_| {
            ConnectionSnafu { message: format!("bi-stream to {} is closed", self.server) }.build()
        })
    }

    async fn close(&self) {
        if self.outbound.lock().take().is_some() {
            debug!(server = %self.server, "bi-stream closed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_targets_grpc_port() {
        let connector = GrpcConnector::new(Duration::from_millis(100));
        let endpoint = connector.endpoint(&ServerDescriptor::new("127.0.0.1", 8848)).unwrap();
        assert_eq!(endpoint.uri().to_string(), "http://127.0.0.1:9848/");
    }

    #[test]
    fn https_scheme_selects_tls() {
        let connector = GrpcConnector::new(Duration::from_millis(100));
        let server = ServerDescriptor::new("secure.example.io", 443)
            .with_scheme("https")
            .with_grpc_port(9443);
        let endpoint = connector.endpoint(&server).unwrap();
        assert_eq!(endpoint.uri().to_string(), "https://secure.example.io:9443/");
    }

    #[test]
    fn endpoint_rejects_unparsable_host() {
        let connector = GrpcConnector::new(Duration::from_millis(100));
        let result = connector.endpoint(&ServerDescriptor::new("bad host with spaces", 8848));
        assert!(matches!(result, Err(SdkError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_a_connection_failure() {
        let connector = GrpcConnector::new(Duration::from_millis(200));
        let server = ServerDescriptor::new("127.0.0.1", 1).with_grpc_port(1);
        let err = connector.connect(&server).await.unwrap_err();
        assert!(err.is_connection_failure(), "unexpected error: {err}");
    }
}
