//! The RPC client: one live connection, switched between servers as needed.
//!
//! # State machine
//!
//! ```text
//!                 start()              connected
//! Uninitialized ──────────▶ Starting ────────────▶ Running ◀─────────┐
//!       ▲                      │                     │               │ new connection
//!       └──────────────────────┘                     │ failure /     │ published, or
//!          every attempt failed                      │ reset push    │ every candidate
//!                                                    ▼               │ failed
//!                                             SwitchingServer ───────┘
//!
//! Running / SwitchingServer / Starting ──shutdown()──▶ ShuttingDown ──▶ Terminated
//! ```
//!
//! Every transition goes through one compare-and-set on the state channel,
//! so readers always see a legal state and can wait for the next one.
//!
//! # Switching
//!
//! At most one switch runs per client. A switch request that finds another
//! one in flight is dropped, so a burst of failures produces a single
//! replacement. The new connection is established and published before the
//! old one is closed, so a running client is never without a connection.
//!
//! Requests issued while a switch is in flight wait for it to finish, bounded
//! by their own timeout, and then use whichever connection is current.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use rand::seq::SliceRandom;
use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    CLIENT_VERSION,
    config::{RetryPolicy, detect_local_ip},
    connection::StreamingConnection,
    error::{Result, SdkError},
    handler::{PushHandlerEntry, PushHandlerRegistry},
    message::{
        ConnectionSetupRequest, HealthCheckRequest, ResponseMessage, ResponseRegistry, RpcRequest,
        RpcResponse,
    },
    metrics::{ConnectionEvent, RequestMetrics, default_metrics},
    retry::with_retry_cancellable,
    server::{ServerDescriptor, ServerRegistry},
    transport::{Connector, PushStream},
};

/// Timeout of one keep-alive probe.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle state of an [`RpcClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Created, never started, or the last start failed.
    Uninitialized,
    /// Looking for a first server.
    Starting,
    /// Connected and serving requests.
    Running,
    /// Replacing the connection.
    SwitchingServer,
    /// Releasing resources.
    ShuttingDown,
    /// Stopped for good.
    Terminated,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::SwitchingServer => "switching_server",
            Self::ShuttingDown => "shutting_down",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// A connection lifecycle event, broadcast to [`RpcClient::subscribe_events`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEvent {
    /// What happened.
    pub kind: ConnectionEvent,
    /// The server it happened with.
    pub server: ServerDescriptor,
}

struct ClientInner {
    name: String,
    tenant: String,
    labels: HashMap<String, String>,
    client_ip: String,
    registry: ServerRegistry,
    connector: Arc<dyn Connector>,
    responses: Arc<ResponseRegistry>,
    handlers: PushHandlerRegistry,
    metrics: Arc<dyn RequestMetrics>,
    retry_policy: RetryPolicy,
    timeout: Duration,
    keep_alive_interval: Duration,
    state: watch::Sender<ClientState>,
    connection: ArcSwapOption<StreamingConnection>,
    switch_lock: Arc<AsyncMutex<()>>,
    events: broadcast::Sender<ClientEvent>,
    switches: AtomicU64,
    shutdown: CancellationToken,
}

/// A client holding one streaming connection to the backend.
///
/// Cloning is cheap; clones share state, connection and background tasks.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

#[bon::bon]
impl RpcClient {
    /// Creates a client in the `Uninitialized` state. Nothing connects until
    /// [`start`](Self::start).
    #[builder]
    pub fn new(
        #[builder(into)] name: String,
        #[builder(into, default)] tenant: String,
        #[builder(default)] labels: HashMap<String, String>,
        registry: ServerRegistry,
        connector: Arc<dyn Connector>,
        #[builder(default = Arc::new(ResponseRegistry::with_builtins()))]
        responses: Arc<ResponseRegistry>,
        #[builder(default)] handlers: Vec<PushHandlerEntry>,
        #[builder(default = default_metrics())] metrics: Arc<dyn RequestMetrics>,
        #[builder(into, default = detect_local_ip())] client_ip: String,
        #[builder(default)] retry_policy: RetryPolicy,
        /// Timeout of handshake calls.
        #[builder(default = DEFAULT_TIMEOUT)]
        timeout: Duration,
        /// Idle time after which the connection is probed.
        #[builder(default = DEFAULT_KEEP_ALIVE_INTERVAL)]
        keep_alive_interval: Duration,
    ) -> Self {
        let registry_handlers = PushHandlerRegistry::new();
        for entry in handlers {
            registry_handlers.register(entry);
        }
        let (state, _) = watch::channel(ClientState::Uninitialized);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ClientInner {
                name,
                tenant,
                labels,
                client_ip,
                registry,
                connector,
                responses,
                handlers: registry_handlers,
                metrics,
                retry_policy,
                timeout,
                keep_alive_interval,
                state,
                connection: ArcSwapOption::empty(),
                switch_lock: Arc::new(AsyncMutex::new(())),
                events,
                switches: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

impl RpcClient {
    /// Returns the client's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the namespace sent in the connection setup.
    #[must_use]
    pub fn tenant(&self) -> &str {
        &self.inner.tenant
    }

    /// Returns the labels sent in the connection setup.
    #[must_use]
    pub fn labels(&self) -> &HashMap<String, String> {
        &self.inner.labels
    }

    /// Returns the IP reported in every envelope.
    #[must_use]
    pub fn client_ip(&self) -> &str {
        &self.inner.client_ip
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Returns a receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Returns true when the client is `Running`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ClientState::Running
    }

    /// Returns the server of the current connection.
    #[must_use]
    pub fn current_server(&self) -> Option<ServerDescriptor> {
        self.inner.connection.load().as_ref().map(|c| c.server().clone())
    }

    /// Returns the id of the current connection.
    #[must_use]
    pub fn connection_id(&self) -> Option<String> {
        self.inner.connection.load().as_ref().map(|c| c.connection_id().to_owned())
    }

    /// Number of completed connection replacements.
    #[must_use]
    pub fn switch_count(&self) -> u64 {
        self.inner.switches.load(Ordering::SeqCst)
    }

    /// Returns the server registry this client picks servers from.
    #[must_use]
    pub fn registry(&self) -> &ServerRegistry {
        &self.inner.registry
    }

    /// Subscribes to connection events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Registers a push handler. Safe on a running client.
    ///
    /// Returns false when the type is served by a built-in handler.
    pub fn register_push_handler(&self, entry: PushHandlerEntry) -> bool {
        self.inner.handlers.register(entry)
    }

    /// Returns the push handler registry.
    #[must_use]
    pub fn push_handlers(&self) -> &PushHandlerRegistry {
        &self.inner.handlers
    }

    /// Moves from `from` states to `to`. Returns false, changing nothing, when
    /// the current state is not in `from`.
    fn transition(&self, from: &[ClientState], to: ClientState) -> bool {
        let mut previous = None;
        let moved = self.inner.state.send_if_modified(|state| {
            if from.contains(state) {
                previous = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });
        if let Some(previous) = previous {
            debug!(client = %self.inner.name, from = %previous, to = %to, "state transition");
        }
        moved
    }

    /// Connects to a first server and starts the background tasks.
    ///
    /// Does nothing unless the client is `Uninitialized`. Servers are taken
    /// from the registry in round-robin order, retrying per the retry policy.
    ///
    /// # Errors
    ///
    /// Returns the retry error when no server could be reached; the client is
    /// back in `Uninitialized` and may be started again. Returns
    /// [`SdkError::Shutdown`] if the client was shut down meanwhile.
    pub async fn start(&self) -> Result<()> {
        if !self.transition(&[ClientState::Uninitialized], ClientState::Starting) {
            return Ok(());
        }
        let _switching = self.inner.switch_lock.lock().await;

        let result = with_retry_cancellable(&self.inner.retry_policy, &self.inner.shutdown, || async {
            let server = self.inner.registry.next_server()?;
            self.connect_to(&server).await
        })
        .await;

        let (connection, pushes) = match result {
            Ok(connected) => connected,
            Err(e) => {
                warn!(client = %self.inner.name, error = %e, "failed to start client");
                self.transition(&[ClientState::Starting], ClientState::Uninitialized);
                return Err(e);
            },
        };

        let connection = Arc::new(connection);
        self.inner.connection.store(Some(Arc::clone(&connection)));
        if !self.transition(&[ClientState::Starting], ClientState::Running) {
            self.inner.connection.store(None);
            connection.close().await;
            return Err(SdkError::Shutdown);
        }

        self.spawn_push_loop(Arc::clone(&connection), pushes);
        self.spawn_health_check();
        self.spawn_registry_watch();
        self.emit(ConnectionEvent::Connected, connection.server());
        info!(client = %self.inner.name, server = %connection.server(), "client started");
        Ok(())
    }

    /// Sends a request over the current connection.
    ///
    /// While a server switch is in flight the call waits for it to finish.
    /// A connection-level failure is returned to the caller and schedules a
    /// switch for later calls.
    ///
    /// # Errors
    ///
    /// - [`SdkError::NotRunning`] if the client is not running
    /// - [`SdkError::Timeout`] if the switch or the call outlasts `timeout`
    /// - any error from [`StreamingConnection::request_unary`]
    pub async fn request(
        &self,
        request: &dyn RpcRequest,
        timeout: Duration,
    ) -> Result<Box<dyn RpcResponse>> {
        let started = Instant::now();
        let timeout_error = || SdkError::timeout(timeout);

        let mut state = self.inner.state.subscribe();
        let current = match tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s != ClientState::SwitchingServer),
        )
        .await
        {
            Ok(Ok(current)) => *current,
            Ok(Err(_)) => return Err(SdkError::Shutdown),
            Err(_) => return Err(timeout_error()),
        };
        if current != ClientState::Running {
            return Err(SdkError::NotRunning { state: current.to_string() });
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(timeout_error());
        }
        let Some(connection) = self.inner.connection.load_full() else {
            return Err(SdkError::NotRunning { state: current.to_string() });
        };

        let result = connection.request_unary(request, remaining).await;
        if let Err(e) = &result
            && e.is_connection_failure()
        {
            warn!(
                client = %self.inner.name,
                server = %connection.server(),
                error = %e,
                "request failed on connection, scheduling server switch"
            );
            self.schedule_switch(Some(&connection), None, true);
        }
        result
    }

    /// Sends a request and downcasts the response to `R`.
    ///
    /// # Errors
    ///
    /// As [`request`](Self::request), plus
    /// [`SdkError::UnsupportedResponseType`] when the response is not an `R`.
    pub async fn request_typed<R: ResponseMessage>(
        &self,
        request: &dyn RpcRequest,
        timeout: Duration,
    ) -> Result<R> {
        self.request(request, timeout).await?.downcast()
    }

    /// Schedules a switch to another server on a background task.
    ///
    /// With a `target`, only that server is tried. With `choose_randomly`,
    /// every other known server is tried once in random order. Otherwise the
    /// next server in round-robin order is tried.
    ///
    /// Returns false when the request was dropped because another switch is
    /// in flight or the client is not running.
    pub fn switch_server_async(&self, target: Option<ServerDescriptor>, choose_randomly: bool) -> bool {
        self.schedule_switch(None, target, choose_randomly)
    }

    /// Like [`switch_server_async`](Self::switch_server_async). With `failed`,
    /// the switch is dropped unless that connection is still the current one.
    fn schedule_switch(
        &self,
        failed: Option<&Arc<StreamingConnection>>,
        target: Option<ServerDescriptor>,
        choose_randomly: bool,
    ) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }
        let Ok(guard) = Arc::clone(&self.inner.switch_lock).try_lock_owned() else {
            debug!(client = %self.inner.name, "server switch already in progress");
            return false;
        };
        // The connection only changes under the switch lock.
        if let Some(failed) = failed {
            let current = self.inner.connection.load();
            if !current.as_ref().is_some_and(|c| Arc::ptr_eq(c, failed)) {
                debug!(client = %self.inner.name, "connection already replaced");
                return false;
            }
        }
        if !self.transition(&[ClientState::Running], ClientState::SwitchingServer) {
            return false;
        }

        let client = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            client.switch_server(target, choose_randomly).await;
        });
        true
    }

    async fn switch_server(&self, target: Option<ServerDescriptor>, choose_randomly: bool) {
        let current = self.current_server();
        let candidates = self.switch_candidates(target, choose_randomly, current.as_ref());

        for server in candidates {
            let connected = tokio::select! {
                biased;
                () = self.inner.shutdown.cancelled() => return,
                connected = self.connect_to(&server) => connected,
            };
            let Ok((connection, pushes)) = connected else {
                continue;
            };
            if self.inner.shutdown.is_cancelled() {
                connection.close().await;
                return;
            }

            let connection = Arc::new(connection);
            let previous = self.inner.connection.swap(Some(Arc::clone(&connection)));
            self.spawn_push_loop(Arc::clone(&connection), pushes);
            self.emit(ConnectionEvent::Connected, connection.server());
            if let Some(previous) = previous {
                previous.close().await;
                self.emit(ConnectionEvent::Disconnected, previous.server());
            }

            self.inner.switches.fetch_add(1, Ordering::SeqCst);
            self.inner.metrics.record_switch(true);
            self.transition(&[ClientState::SwitchingServer], ClientState::Running);
            info!(
                client = %self.inner.name,
                from = ?current.as_ref().map(ToString::to_string),
                to = %server,
                "switched server"
            );
            return;
        }

        self.inner.metrics.record_switch(false);
        self.transition(&[ClientState::SwitchingServer], ClientState::Running);
        warn!(client = %self.inner.name, "server switch failed, keeping current connection");
    }

    fn switch_candidates(
        &self,
        target: Option<ServerDescriptor>,
        choose_randomly: bool,
        current: Option<&ServerDescriptor>,
    ) -> Vec<ServerDescriptor> {
        let servers = self.inner.registry.servers();
        if let Some(target) = target {
            // Prefer the registry's entry so its scheme and ports carry over.
            let known = servers
                .iter()
                .find(|s| s.host() == target.host() && s.port() == target.port())
                .cloned();
            return vec![known.unwrap_or(target)];
        }
        if choose_randomly {
            let mut others: Vec<ServerDescriptor> =
                servers.iter().filter(|s| Some(*s) != current).cloned().collect();
            if others.is_empty() {
                others = servers.to_vec();
            }
            others.shuffle(&mut rand::rng());
            return others;
        }
        self.inner.registry.next_server().into_iter().collect()
    }

    async fn connect_to(
        &self,
        server: &ServerDescriptor,
    ) -> Result<(StreamingConnection, PushStream)> {
        let setup = ConnectionSetupRequest {
            client_version: CLIENT_VERSION.to_owned(),
            tenant: self.inner.tenant.clone(),
            labels: self.inner.labels.clone(),
            ..Default::default()
        };
        let result = StreamingConnection::establish(
            self.inner.connector.as_ref(),
            server,
            Arc::clone(&self.inner.responses),
            &self.inner.client_ip,
            &setup,
            self.inner.timeout,
        )
        .await;
        if let Err(e) = &result {
            warn!(client = %self.inner.name, server = %server, error = %e, "failed to connect");
            self.emit(ConnectionEvent::Failed, server);
        }
        result
    }

    fn emit(&self, kind: ConnectionEvent, server: &ServerDescriptor) {
        self.inner.metrics.record_connection(&server.address(), kind);
        // No receivers is fine.
        let _ = self.inner.events.send(ClientEvent { kind, server: server.clone() });
    }

    fn spawn_push_loop(&self, connection: Arc<StreamingConnection>, mut pushes: PushStream) {
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => return,
                    next = pushes.next() => next,
                };
                let Some(client) = upgrade(&weak) else {
                    return;
                };
                match next {
                    Some(Ok(payload)) => {
                        // Handlers only schedule a switch, which closes this
                        // connection from its own task, so the ack is queued
                        // on the stream before the close.
                        if let Some(ack) = client.inner.handlers.dispatch(&payload, &client).await
                            && let Err(e) = connection.send_push(ack)
                        {
                            warn!(client = %client.inner.name, error = %e, "failed to acknowledge push");
                        }
                    },
                    Some(Err(e)) => {
                        warn!(client = %client.inner.name, error = %e, "push stream failed");
                        break;
                    },
                    None => break,
                }
            }

            if connection.is_abandoned() || cancel.is_cancelled() {
                return;
            }
            if let Some(client) = upgrade(&weak)
                && client.schedule_switch(Some(&connection), None, true)
            {
                warn!(
                    client = %client.inner.name,
                    server = %connection.server(),
                    "push stream ended, switching server"
                );
            }
        });
    }

    fn spawn_health_check(&self) {
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.shutdown.clone();
        let period = self.inner.keep_alive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {},
                }
                let Some(client) = upgrade(&weak) else {
                    return;
                };
                client.health_check().await;
            }
        });
    }

    async fn health_check(&self) {
        if !self.is_running() {
            return;
        }
        let Some(connection) = self.inner.connection.load_full() else {
            return;
        };
        if connection.idle_for() < self.inner.keep_alive_interval {
            return;
        }

        let healthy = match connection
            .request_unary(&HealthCheckRequest::default(), HEALTH_CHECK_TIMEOUT)
            .await
        {
            Ok(response) => response.base().is_success(),
            Err(e) => {
                debug!(client = %self.inner.name, error = %e, "health check failed");
                false
            },
        };
        if !healthy {
            warn!(
                client = %self.inner.name,
                server = %connection.server(),
                "health check failed, scheduling server switch"
            );
            self.schedule_switch(Some(&connection), None, true);
        }
    }

    fn spawn_registry_watch(&self) {
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.shutdown.clone();
        let mut changes = self.inner.registry.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    changed = changes.changed() => if changed.is_err() { return },
                }
                let Some(client) = upgrade(&weak) else {
                    return;
                };
                if let Some(current) = client.current_server()
                    && !client.inner.registry.contains(&current)
                {
                    info!(
                        client = %client.inner.name,
                        server = %current,
                        "current server left the server list, scheduling switch"
                    );
                    client.switch_server_async(None, true);
                }
            }
        });
    }

    /// Stops the client: background tasks end, the connection is closed and
    /// the state becomes `Terminated`. Idempotent.
    pub async fn shutdown(&self) {
        let stoppable = [
            ClientState::Uninitialized,
            ClientState::Starting,
            ClientState::Running,
            ClientState::SwitchingServer,
        ];
        if !self.transition(&stoppable, ClientState::ShuttingDown) {
            return;
        }
        self.inner.shutdown.cancel();

        // Wait for an in-flight start or switch to observe the cancellation.
        let _switching = self.inner.switch_lock.lock().await;
        if let Some(connection) = self.inner.connection.swap(None) {
            connection.close().await;
            self.emit(ConnectionEvent::Disconnected, connection.server());
        }
        self.transition(&[ClientState::ShuttingDown], ClientState::Terminated);
        info!(client = %self.inner.name, "client shut down");
    }
}

fn upgrade(weak: &Weak<ClientInner>) -> Option<RpcClient> {
    weak.upgrade().map(|inner| RpcClient { inner })
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("server", &self.current_server())
            .finish_non_exhaustive()
    }
}
