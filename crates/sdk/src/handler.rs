//! Handlers for server-initiated requests.
//!
//! The server pushes requests over the bidirectional stream. Each push is
//! routed by its envelope type to a [`ServerRequestHandler`], and the
//! handler's response is written back on the same stream as the
//! acknowledgement, carrying the push's request id.
//!
//! Two handlers are always installed and cannot be replaced:
//!
//! | Type | Handler | Effect |
//! |------|---------|--------|
//! | `ConnectResetRequest` | [`ConnectResetHandler`] | Switches the client to another server |
//! | `ClientDetectionRequest` | [`ClientDetectionHandler`] | None; proves the client is alive |
//!
//! Handlers may be registered at any time, including on a running client.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};
use xgrpc_proto::proto::Payload;

use crate::{
    client::{ClientState, RpcClient},
    config::DEFAULT_SERVER_PORT,
    error::Result,
    message::{
        ClientDetectionRequest, ClientDetectionResponse, ConnectResetRequest,
        ConnectResetResponse, RequestMessage, ResponseBase, ResponseMessage, decode_request,
        encode_response,
    },
    server::ServerDescriptor,
};

/// Handles one type of server-initiated request.
///
/// Returning `None` sends no acknowledgement.
#[async_trait::async_trait]
pub trait ServerRequestHandler: Send + Sync + 'static {
    /// Request type this handler accepts.
    type Request: RequestMessage;
    /// Acknowledgement type.
    type Response: ResponseMessage;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Handles one pushed request.
    async fn handle(&self, request: Self::Request, client: &RpcClient) -> Option<Self::Response>;
}

#[async_trait::async_trait]
trait ErasedHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn dispatch(&self, payload: &Payload, client: &RpcClient) -> Result<Option<Payload>>;
}

struct Typed<H>(H);

#[async_trait::async_trait]
impl<H: ServerRequestHandler> ErasedHandler for Typed<H> {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn dispatch(&self, payload: &Payload, client: &RpcClient) -> Result<Option<Payload>> {
        let request: H::Request = decode_request(payload)?;
        let request_id = request.base().request_id.clone();
        let Some(mut response) = self.0.handle(request, client).await else {
            return Ok(None);
        };
        response.base_mut().request_id = request_id;
        encode_response(&response, client.client_ip()).map(Some)
    }
}

/// A handler bound to the message type it serves.
#[derive(Clone)]
pub struct PushHandlerEntry {
    message_type: &'static str,
    handler: Arc<dyn ErasedHandler>,
}

impl PushHandlerEntry {
    /// Wraps `handler` for registration under its request type.
    pub fn new<H: ServerRequestHandler>(handler: H) -> Self {
        Self { message_type: H::Request::TYPE, handler: Arc::new(Typed(handler)) }
    }

    /// Returns the request type this entry serves.
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }
}

impl fmt::Debug for PushHandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushHandlerEntry")
            .field("message_type", &self.message_type)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Maps pushed request types to handlers.
pub struct PushHandlerRegistry {
    handlers: RwLock<HashMap<&'static str, PushHandlerEntry>>,
}

const BUILTIN_TYPES: [&str; 2] = [ConnectResetRequest::TYPE, ClientDetectionRequest::TYPE];

impl PushHandlerRegistry {
    /// Creates a registry holding only the built-in handlers.
    #[must_use]
    pub fn new() -> Self {
        let handlers = [
            PushHandlerEntry::new(ConnectResetHandler),
            PushHandlerEntry::new(ClientDetectionHandler),
        ]
        .into_iter()
        .map(|entry| (entry.message_type, entry))
        .collect();
        Self { handlers: RwLock::new(handlers) }
    }

    /// Registers `entry`, replacing a previous handler for the same type.
    ///
    /// Returns false, leaving the registry unchanged, when the type belongs
    /// to a built-in handler.
    pub fn register(&self, entry: PushHandlerEntry) -> bool {
        if BUILTIN_TYPES.contains(&entry.message_type) {
            warn!(message_type = entry.message_type, "built-in push handler cannot be replaced");
            return false;
        }
        debug!(message_type = entry.message_type, handler = entry.handler.name(), "push handler registered");
        self.handlers.write().insert(entry.message_type, entry);
        true
    }

    /// Returns true if a handler serves `message_type`.
    #[must_use]
    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers.read().contains_key(message_type)
    }

    /// Returns the served types, sorted.
    #[must_use]
    pub fn message_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.read().keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Routes one push to its handler and returns the acknowledgement to send.
    ///
    /// Unknown types, undecodable bodies and handlers that decline to answer
    /// are logged and yield `None`.
    pub async fn dispatch(&self, payload: &Payload, client: &RpcClient) -> Option<Payload> {
        let message_type = payload.message_type();
        let handler = self.handlers.read().get(message_type).map(|e| Arc::clone(&e.handler));
        let Some(handler) = handler else {
            warn!(message_type, "no handler for pushed request, dropping");
            return None;
        };

        match handler.dispatch(payload, client).await {
            Ok(Some(ack)) => Some(ack),
            Ok(None) => {
                warn!(message_type, handler = handler.name(), "push handler returned no response");
                None
            },
            Err(e) => {
                warn!(message_type, error = %e, "failed to handle pushed request");
                None
            },
        }
    }
}

impl Default for PushHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PushHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushHandlerRegistry").field("types", &self.message_types()).finish()
    }
}

/// Reconnects when the server asks the client to move.
///
/// A running client switches to the named server, or to a random other one
/// when the push names none. The push is acknowledged in every case.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectResetHandler;

#[async_trait::async_trait]
impl ServerRequestHandler for ConnectResetHandler {
    type Request = ConnectResetRequest;
    type Response = ConnectResetResponse;

    fn name(&self) -> &str {
        "ConnectResetHandler"
    }

    async fn handle(&self, request: Self::Request, client: &RpcClient) -> Option<Self::Response> {
        let ack = ConnectResetResponse { base: ResponseBase::success() };
        if client.state() != ClientState::Running {
            debug!(client = client.name(), state = %client.state(), "ignoring connect reset");
            return Some(ack);
        }

        let server_ip = request.server_ip.trim();
        if server_ip.is_empty() {
            info!(client = client.name(), "server requested reconnect");
            client.switch_server_async(None, true);
            return Some(ack);
        }

        let port = request.server_port.trim();
        let port = if port.is_empty() {
            DEFAULT_SERVER_PORT
        } else {
            match port.parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => {
                    error!(client = client.name(), server_port = port, "connect reset carries invalid port");
                    return Some(ack);
                },
            }
        };
        info!(client = client.name(), server_ip, port, "server requested reconnect to target");
        client.switch_server_async(Some(ServerDescriptor::new(server_ip, port)), false);
        Some(ack)
    }
}

/// Answers liveness probes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientDetectionHandler;

#[async_trait::async_trait]
impl ServerRequestHandler for ClientDetectionHandler {
    type Request = ClientDetectionRequest;
    type Response = ClientDetectionResponse;

    fn name(&self) -> &str {
        "ClientDetectionHandler"
    }

    async fn handle(&self, _request: Self::Request, _client: &RpcClient) -> Option<Self::Response> {
        Some(ClientDetectionResponse { base: ResponseBase::success() })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        message::{RequestBase, encode_request},
        mock::{MockConnector, MockHttpAgent, MockServer},
        server::ServerRegistry,
    };

    #[derive(Debug, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct NoticeRequest {
        #[serde(flatten)]
        base: RequestBase,
        text: String,
    }

    impl RequestMessage for NoticeRequest {
        const TYPE: &'static str = "NoticeRequest";
        fn base(&self) -> &RequestBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut RequestBase {
            &mut self.base
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct NoticeResponse {
        #[serde(flatten)]
        base: ResponseBase,
    }

    impl ResponseMessage for NoticeResponse {
        const TYPE: &'static str = "NoticeResponse";
        fn base(&self) -> &ResponseBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut ResponseBase {
            &mut self.base
        }
    }

    struct NoticeHandler {
        answer: bool,
    }

    #[async_trait::async_trait]
    impl ServerRequestHandler for NoticeHandler {
        type Request = NoticeRequest;
        type Response = NoticeResponse;

        async fn handle(&self, request: NoticeRequest, _: &RpcClient) -> Option<NoticeResponse> {
            assert_eq!(request.text, "hello");
            self.answer.then(|| NoticeResponse { base: ResponseBase::success() })
        }
    }

    async fn idle_client() -> RpcClient {
        let server = MockServer::new("10.0.0.1", 8848);
        let registry = ServerRegistry::builder()
            .servers(vec![server.descriptor().clone()])
            .http_agent(Arc::new(MockHttpAgent::new()))
            .build()
            .await
            .unwrap();
        RpcClient::builder()
            .name("handler-test")
            .registry(registry)
            .connector(Arc::new(MockConnector::new([server])))
            .client_ip("10.0.0.99")
            .build()
    }

    fn notice(request_id: &str) -> Payload {
        let mut request = NoticeRequest { text: "hello".to_owned(), ..Default::default() };
        request.base.request_id = request_id.to_owned();
        encode_request(&request, "").unwrap()
    }

    #[test]
    fn builtins_are_present_and_protected() {
        let registry = PushHandlerRegistry::new();
        assert_eq!(registry.message_types(), vec!["ClientDetectionRequest", "ConnectResetRequest"]);

        struct Hijack;
        #[async_trait::async_trait]
        impl ServerRequestHandler for Hijack {
            type Request = ConnectResetRequest;
            type Response = ConnectResetResponse;
            async fn handle(&self, _: ConnectResetRequest, _: &RpcClient) -> Option<ConnectResetResponse> {
                None
            }
        }
        assert!(!registry.register(PushHandlerEntry::new(Hijack)));
        assert!(registry.contains("ConnectResetRequest"));
    }

    #[tokio::test]
    async fn dispatch_copies_request_id_into_ack() {
        let client = idle_client().await;
        let registry = PushHandlerRegistry::new();
        assert!(registry.register(PushHandlerEntry::new(NoticeHandler { answer: true })));

        let ack = registry.dispatch(&notice("42"), &client).await.unwrap();
        assert_eq!(ack.message_type(), "NoticeResponse");
        assert_eq!(ack.metadata.as_ref().unwrap().client_ip, "10.0.0.99");
        let body: serde_json::Value = serde_json::from_slice(ack.body_bytes()).unwrap();
        assert_eq!(body["requestId"], "42");
        assert_eq!(body["resultCode"], 200);
    }

    #[tokio::test]
    async fn unknown_type_and_declined_handler_yield_no_ack() {
        let client = idle_client().await;
        let registry = PushHandlerRegistry::new();
        assert!(registry.dispatch(&notice("1"), &client).await.is_none());

        registry.register(PushHandlerEntry::new(NoticeHandler { answer: false }));
        assert!(registry.dispatch(&notice("2"), &client).await.is_none());
    }

    #[tokio::test]
    async fn malformed_body_is_dropped() {
        let client = idle_client().await;
        let registry = PushHandlerRegistry::new();
        let payload = Payload::new("ConnectResetRequest", HashMap::new(), "", b"{oops".to_vec());
        assert!(registry.dispatch(&payload, &client).await.is_none());
    }

    #[tokio::test]
    async fn client_detection_acks_success() {
        let client = idle_client().await;
        let registry = PushHandlerRegistry::new();
        let mut probe = ClientDetectionRequest::default();
        probe.base.request_id = "probe-1".to_owned();
        let ack = registry.dispatch(&encode_request(&probe, "").unwrap(), &client).await.unwrap();
        assert_eq!(ack.message_type(), "ClientDetectionResponse");
        let body: serde_json::Value = serde_json::from_slice(ack.body_bytes()).unwrap();
        assert_eq!(body["requestId"], "probe-1");
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn connect_reset_on_idle_client_acks_without_switching() {
        let client = idle_client().await;
        let registry = PushHandlerRegistry::new();
        let reset = ConnectResetRequest { server_ip: "10.0.0.2".to_owned(), ..Default::default() };
        let ack = registry.dispatch(&encode_request(&reset, "").unwrap(), &client).await.unwrap();
        assert_eq!(ack.message_type(), "ConnectResetResponse");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.state(), ClientState::Uninitialized);
    }
}
