//! In-memory mock backend for SDK testing.
//!
//! This module provides controllable stand-ins for the two network
//! collaborators of the SDK, so client behavior can be tested without a
//! running backend:
//!
//! - [`MockHttpAgent`]: scripted HTTP responses for discovery and failover calls
//! - [`MockServer`] + [`MockConnector`]: an in-memory server that answers unary
//!   calls, records stream writes and pushes requests to the client
//!
//! # Features
//!
//! - **Responders**: Answer each request type with a custom reply
//! - **Failure injection**: Mark servers unreachable, inject UNAVAILABLE errors or delays
//! - **Request counting**: Track requests per type for verification
//! - **Push injection**: Send server-initiated requests over the live stream
//! - **Event log**: Ordered connect/close events across all servers
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use xgrpc_sdk::{
//!     HealthCheckRequest, RpcClient, ServerRegistry,
//!     mock::{MockConnector, MockHttpAgent, MockServer},
//! };
//!
//! # async fn example() -> xgrpc_sdk::Result<()> {
//! let server = MockServer::new("10.0.0.1", 8848);
//! let registry = ServerRegistry::builder()
//!     .servers(vec![server.descriptor().clone()])
//!     .http_agent(Arc::new(MockHttpAgent::new()))
//!     .build()
//!     .await?;
//! let client = RpcClient::builder()
//!     .name("example")
//!     .registry(registry)
//!     .connector(Arc::new(MockConnector::new([server.clone()])))
//!     .build();
//! client.start().await?;
//! client.request(&HealthCheckRequest::default(), Duration::from_secs(1)).await?;
//! assert_eq!(server.request_count("HealthCheckRequest"), 1);
//! # Ok(())
//! # }
//! ```

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::Code;
use xgrpc_proto::proto::Payload;

use crate::{
    error::{ConnectionSnafu, Result, SdkError},
    http::{HttpAgent, HttpRequest, HttpResponse},
    message::{
        HealthCheckResponse, RequestMessage, ResponseBase, ResponseMessage, ServerCheckResponse,
        encode_request, encode_response,
    },
    server::ServerDescriptor,
    transport::{Connected, Connector, Transport},
};

/// Scripted [`HttpAgent`].
///
/// Queued responses are returned first, in order; once the queue is empty the
/// default response is returned, or an error if none is set.
#[derive(Debug, Default)]
pub struct MockHttpAgent {
    queue: Mutex<VecDeque<Result<HttpResponse>>>,
    default_response: Mutex<Option<HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpAgent {
    /// Creates an agent with no scripted responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one outcome.
    pub fn push_response(&self, response: Result<HttpResponse>) {
        self.queue.lock().push_back(response);
    }

    /// Sets the response returned once the queue is drained.
    pub fn set_default_response(&self, response: HttpResponse) {
        *self.default_response.lock() = Some(response);
    }

    /// Returns every request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait::async_trait]
impl HttpAgent for MockHttpAgent {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = request.url.clone();
        self.requests.lock().push(request);
        if let Some(response) = self.queue.lock().pop_front() {
            return response;
        }
        match self.default_response.lock().clone() {
            Some(response) => Ok(response),
            None => Err(SdkError::HttpRequest { url, message: "no scripted response".to_owned() }),
        }
    }
}

/// What a [`MockServer`] answers to one unary call.
#[derive(Debug)]
pub enum Reply {
    /// A response envelope.
    Payload(Payload),
    /// A call failure.
    Error(SdkError),
}

impl Reply {
    /// Encodes a typed response.
    #[must_use]
    pub fn response<R: ResponseMessage>(response: R) -> Self {
        match encode_response(&response, "") {
            Ok(payload) => Self::Payload(payload),
            Err(e) => Self::Error(e),
        }
    }

    /// An `UNAVAILABLE` failure.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Error(SdkError::Rpc { code: Code::Unavailable, message: message.into() })
    }
}

type Responder = Arc<dyn Fn(&Payload) -> Reply + Send + Sync>;

/// Ordered connection events recorded by a [`MockConnector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// A connection to the server at this address was opened.
    Connected(String),
    /// A connection to the server at this address was closed.
    Closed(String),
}

struct MockState {
    descriptor: ServerDescriptor,
    reachable: AtomicBool,
    unavailable_count: AtomicUsize,
    delay_ms: AtomicU64,
    connect_delay_ms: AtomicU64,
    connect_count: AtomicUsize,
    close_count: AtomicUsize,
    requests: Mutex<Vec<Payload>>,
    stream_messages: Mutex<Vec<Payload>>,
    responders: RwLock<HashMap<String, Responder>>,
    // Sender of the most recent stream, tagged with its connection number.
    push_sender: Mutex<Option<(usize, mpsc::UnboundedSender<Result<Payload>>)>>,
}

/// In-memory backend server.
///
/// Cloning shares state, so tests keep a handle while the connector owns another.
#[derive(Clone)]
pub struct MockServer {
    state: Arc<MockState>,
}

impl fmt::Debug for MockServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockServer").field("descriptor", &self.state.descriptor).finish()
    }
}

impl MockServer {
    /// Creates a reachable server that answers server checks and health checks.
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        let server = Self {
            state: Arc::new(MockState {
                descriptor: ServerDescriptor::new(host, port),
                reachable: AtomicBool::new(true),
                unavailable_count: AtomicUsize::new(0),
                delay_ms: AtomicU64::new(0),
                connect_delay_ms: AtomicU64::new(0),
                connect_count: AtomicUsize::new(0),
                close_count: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                stream_messages: Mutex::new(Vec::new()),
                responders: RwLock::new(HashMap::new()),
                push_sender: Mutex::new(None),
            }),
        };
        server.respond_with("ServerCheckRequest", |_| {
            Reply::response(ServerCheckResponse {
                base: ResponseBase::success(),
                connection_id: uuid::Uuid::new_v4().to_string(),
            })
        });
        server.respond_with("HealthCheckRequest", |_| {
            Reply::response(HealthCheckResponse { base: ResponseBase::success() })
        });
        server
    }

    /// Returns the descriptor clients use to reach this server.
    #[must_use]
    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.state.descriptor
    }

    /// Installs the responder for one request type.
    pub fn respond_with<F>(&self, request_type: &str, responder: F)
    where
        F: Fn(&Payload) -> Reply + Send + Sync + 'static,
    {
        self.state.responders.write().insert(request_type.to_owned(), Arc::new(responder));
    }

    /// Marks the server reachable or not. Unreachable servers refuse new
    /// connections and fail unary calls with `UNAVAILABLE`.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fails the next `count` unary calls with `UNAVAILABLE`.
    pub fn inject_unavailable(&self, count: usize) {
        self.state.unavailable_count.store(count, Ordering::SeqCst);
    }

    /// Delays every unary reply.
    pub fn set_delay(&self, delay: Duration) {
        self.state.delay_ms.store(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Delays every connection attempt.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.connect_delay_ms.store(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Number of unary calls received with the given type.
    #[must_use]
    pub fn request_count(&self, request_type: &str) -> usize {
        self.state.requests.lock().iter().filter(|p| p.message_type() == request_type).count()
    }

    /// Every unary call received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<Payload> {
        self.state.requests.lock().clone()
    }

    /// Every envelope the client wrote onto a stream, including acknowledgements.
    #[must_use]
    pub fn stream_messages(&self) -> Vec<Payload> {
        self.state.stream_messages.lock().clone()
    }

    /// Number of connections opened to this server.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.state.connect_count.load(Ordering::SeqCst)
    }

    /// Number of connections to this server the client closed.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.state.close_count.load(Ordering::SeqCst)
    }

    /// Pushes a request to the client over the most recent live stream.
    ///
    /// Returns false when no stream is open.
    pub fn push<R: RequestMessage>(&self, request: &R) -> bool {
        let Ok(payload) = encode_request(request, "") else {
            return false;
        };
        self.push_payload(payload)
    }

    /// Pushes a raw envelope over the most recent live stream.
    pub fn push_payload(&self, payload: Payload) -> bool {
        match self.state.push_sender.lock().as_ref() {
            Some((_, sender)) => sender.send(Ok(payload)).is_ok(),
            None => false,
        }
    }

    /// Ends the most recent stream from the server side.
    pub fn drop_stream(&self) {
        self.state.push_sender.lock().take();
    }

    fn reply(&self, payload: &Payload) -> Result<Payload> {
        let responder = self.state.responders.read().get(payload.message_type()).cloned();
        match responder {
            Some(responder) => match responder(payload) {
                Reply::Payload(payload) => Ok(payload),
                Reply::Error(e) => Err(e),
            },
            None => Err(SdkError::Rpc {
                code: Code::Unimplemented,
                message: format!("no responder for {}", payload.message_type()),
            }),
        }
    }
}

/// [`Connector`] that routes connections to [`MockServer`]s by host and port.
#[derive(Debug, Clone)]
pub struct MockConnector {
    servers: Arc<HashMap<(String, u16), MockServer>>,
    events: Arc<Mutex<Vec<MockEvent>>>,
}

impl MockConnector {
    /// Creates a connector over the given servers.
    pub fn new(servers: impl IntoIterator<Item = MockServer>) -> Self {
        let servers = servers
            .into_iter()
            .map(|s| ((s.descriptor().host().to_owned(), s.descriptor().port()), s))
            .collect();
        Self { servers: Arc::new(servers), events: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Returns connect and close events in the order they happened.
    #[must_use]
    pub fn events(&self) -> Vec<MockEvent> {
        self.events.lock().clone()
    }

    /// Total connections opened across all servers.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.events.lock().iter().filter(|e| matches!(e, MockEvent::Connected(_))).count()
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(&self, server: &ServerDescriptor) -> Result<Connected> {
        let Some(mock) = self.servers.get(&(server.host().to_owned(), server.port())).cloned()
        else {
            return ConnectionSnafu { message: format!("no mock server at {server}") }.fail();
        };

        let delay = mock.state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !mock.state.reachable.load(Ordering::SeqCst) {
            return ConnectionSnafu { message: format!("connection refused by {server}") }.fail();
        }

        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let stream_id = mock.state.connect_count.fetch_add(1, Ordering::SeqCst) + 1;
        *mock.state.push_sender.lock() = Some((stream_id, push_tx));
        self.events.lock().push(MockEvent::Connected(server.address()));

        let transport = MockTransport {
            server: mock,
            events: Arc::clone(&self.events),
            stream_id,
            closed: AtomicBool::new(false),
        };
        Ok(Connected {
            transport: Arc::new(transport),
            pushes: UnboundedReceiverStream::new(push_rx).boxed(),
        })
    }
}

#[derive(Debug)]
struct MockTransport {
    server: MockServer,
    events: Arc<Mutex<Vec<MockEvent>>>,
    stream_id: usize,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn unary(&self, payload: Payload, _timeout: Duration) -> Result<Payload> {
        let state = &self.server.state;
        if !state.reachable.load(Ordering::SeqCst) {
            return Err(SdkError::Rpc { code: Code::Unavailable, message: "unreachable".to_owned() });
        }
        state.requests.lock().push(payload.clone());

        let injected = state
            .unavailable_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SdkError::Rpc {
                code: Code::Unavailable,
                message: "injected failure".to_owned(),
            });
        }

        let delay = state.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.server.reply(&payload)
    }

    fn send(&self, payload: Payload) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return ConnectionSnafu { message: "stream closed".to_owned() }.fail();
        }
        self.server.state.stream_messages.lock().push(payload);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = &self.server.state;
        {
            let mut current = state.push_sender.lock();
            if current.as_ref().is_some_and(|(id, _)| *id == self.stream_id) {
                current.take();
            }
        }
        state.close_count.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(MockEvent::Closed(self.server.descriptor().address()));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::message::{ClientDetectionRequest, HealthCheckRequest};

    #[tokio::test]
    async fn http_agent_plays_queue_then_default() {
        let agent = MockHttpAgent::new();
        agent.push_response(Ok(HttpResponse { status: 503, body: String::new() }));
        agent.set_default_response(HttpResponse { status: 200, body: "ok".to_owned() });

        let request = HttpRequest {
            method: crate::http::HttpMethod::Get,
            url: "http://x/y".to_owned(),
            headers: HashMap::new(),
            params: HashMap::new(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(agent.request(request.clone()).await.unwrap().status, 503);
        assert_eq!(agent.request(request.clone()).await.unwrap().status, 200);
        assert_eq!(agent.requests().len(), 2);
    }

    #[tokio::test]
    async fn http_agent_without_script_fails() {
        let agent = MockHttpAgent::new();
        let request = HttpRequest {
            method: crate::http::HttpMethod::Get,
            url: "http://x/y".to_owned(),
            headers: HashMap::new(),
            params: HashMap::new(),
            timeout: Duration::from_secs(1),
        };
        assert!(agent.request(request).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_server_refuses_connections() {
        let server = MockServer::new("10.0.0.1", 8848);
        server.set_reachable(false);
        let connector = MockConnector::new([server.clone()]);
        let err = connector.connect(server.descriptor()).await.unwrap_err();
        assert!(err.is_connection_failure());
        assert!(connector.events().is_empty());
    }

    #[tokio::test]
    async fn unknown_server_is_a_connection_error() {
        let connector = MockConnector::new([]);
        let err = connector.connect(&ServerDescriptor::new("10.9.9.9", 1)).await.unwrap_err();
        assert!(matches!(err, SdkError::Connection { .. }));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let server = MockServer::new("10.0.0.1", 8848);
        let connector = MockConnector::new([server.clone()]);
        let connected = connector.connect(server.descriptor()).await.unwrap();
        server.inject_unavailable(1);

        let payload = encode_request(&HealthCheckRequest::default(), "").unwrap();
        let first = connected.transport.unary(payload.clone(), Duration::from_secs(1)).await;
        assert!(matches!(first, Err(SdkError::Rpc { code: Code::Unavailable, .. })));
        assert!(connected.transport.unary(payload, Duration::from_secs(1)).await.is_ok());
        assert_eq!(server.request_count("HealthCheckRequest"), 2);
    }

    #[tokio::test]
    async fn push_reaches_latest_stream_and_close_ends_it() {
        let server = MockServer::new("10.0.0.1", 8848);
        let connector = MockConnector::new([server.clone()]);
        let mut connected = connector.connect(server.descriptor()).await.unwrap();

        assert!(server.push(&ClientDetectionRequest::default()));
        let pushed = connected.pushes.next().await.unwrap().unwrap();
        assert_eq!(pushed.message_type(), "ClientDetectionRequest");

        connected.transport.close().await;
        connected.transport.close().await;
        assert!(!server.push(&ClientDetectionRequest::default()));
        assert!(connected.pushes.next().await.is_none());
        assert_eq!(server.close_count(), 1);
        assert_eq!(
            connector.events(),
            vec![
                MockEvent::Connected(server.descriptor().address()),
                MockEvent::Closed(server.descriptor().address()),
            ]
        );
    }

    #[tokio::test]
    async fn closing_an_old_stream_keeps_the_new_one() {
        let server = MockServer::new("10.0.0.1", 8848);
        let connector = MockConnector::new([server.clone()]);
        let old = connector.connect(server.descriptor()).await.unwrap();
        let mut new = connector.connect(server.descriptor()).await.unwrap();

        old.transport.close().await;
        assert!(server.push(&ClientDetectionRequest::default()));
        assert!(new.pushes.next().await.unwrap().is_ok());
    }
}
