//! The server registry: known backend servers, discovery refresh and failover.
//!
//! # Concurrency
//!
//! The server list is swapped wholesale through an [`ArcSwap`]; readers never
//! observe a partially updated list and never take a lock. The round-robin
//! cursor is a single atomic. Changes are announced on a `watch` channel, which
//! keeps at most one pending notification per subscriber and never blocks the
//! refresh task.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rand::{Rng, seq::IndexedRandom};
use snafu::ensure;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ServerDescriptor,
    discovery::{parse_server_list, server_list_url},
};
use crate::{
    CLIENT_VERSION,
    config::{DEFAULT_CONTEXT_PATH, DEFAULT_SCHEME},
    error::{ConfigInvalidSnafu, EmptyServerListSnafu, HttpSnafu, Result, SdkError},
    http::{HttpAgent, HttpMethod, HttpRequest},
    security::{self, NoopSecurityProvider, SecurityProvider},
};

/// Attempts made against a lone server by [`ServerRegistry::request_with_failover`].
pub const SINGLE_SERVER_RETRY_TIMES: u32 = 3;

const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Tracks backend servers for one manager.
///
/// Cloning is cheap; clones share the list, the cursor and the background
/// refresh task. The task stops on [`shutdown`](Self::shutdown) or once every
/// handle is dropped.
#[derive(Debug, Clone)]
pub struct ServerRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    servers: ArcSwap<Vec<ServerDescriptor>>,
    cursor: AtomicUsize,
    endpoint: Option<String>,
    scheme: String,
    context_path: String,
    min_refresh_interval: Duration,
    request_timeout: Duration,
    last_refresh: Mutex<Option<Instant>>,
    http: Arc<dyn HttpAgent>,
    security: Arc<dyn SecurityProvider>,
    changes: watch::Sender<u64>,
    shutdown: CancellationToken,
}

#[bon::bon]
impl ServerRegistry {
    /// Creates a registry and, when an endpoint is set, performs the first
    /// discovery fetch before returning and starts the background refresh.
    ///
    /// A failed first fetch is logged; the background task keeps trying.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::ConfigInvalid`] when both `servers` and `endpoint`
    /// are empty.
    #[builder]
    pub async fn new(
        #[builder(default)] servers: Vec<ServerDescriptor>,
        endpoint: Option<String>,
        #[builder(into, default = DEFAULT_SCHEME.to_owned())] scheme: String,
        #[builder(into, default = DEFAULT_CONTEXT_PATH.to_owned())] context_path: String,
        #[builder(default = DEFAULT_MIN_REFRESH_INTERVAL)] min_refresh_interval: Duration,
        #[builder(default = DEFAULT_POLL_INTERVAL)] poll_interval: Duration,
        #[builder(default = DEFAULT_HTTP_TIMEOUT)] request_timeout: Duration,
        http_agent: Arc<dyn HttpAgent>,
        #[builder(default = default_security())] security: Arc<dyn SecurityProvider>,
    ) -> Result<Self> {
        let endpoint = endpoint.map(|e| e.trim().to_owned()).filter(|e| !e.is_empty());
        ensure!(
            !servers.is_empty() || endpoint.is_some(),
            ConfigInvalidSnafu { message: "both server list and endpoint are empty" }
        );

        let cursor = if servers.is_empty() { 0 } else { rand::rng().random_range(0..servers.len()) };
        let (changes, _) = watch::channel(0);
        let registry = Self {
            inner: Arc::new(RegistryInner {
                servers: ArcSwap::from_pointee(servers),
                cursor: AtomicUsize::new(cursor),
                endpoint,
                scheme,
                context_path,
                min_refresh_interval,
                request_timeout,
                last_refresh: Mutex::new(None),
                http: http_agent,
                security,
                changes,
                shutdown: CancellationToken::new(),
            }),
        };

        if registry.inner.endpoint.is_some() {
            if let Err(e) = registry.refresh_if_needed().await {
                warn!(error = %e, "initial server list refresh failed");
            }
            registry.start_refresh_task(poll_interval);
        }

        Ok(registry)
    }
}

impl ServerRegistry {
    /// Returns a snapshot of the current server list.
    #[must_use]
    pub fn servers(&self) -> Arc<Vec<ServerDescriptor>> {
        self.inner.servers.load_full()
    }

    /// Returns the number of known servers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.servers.load().len()
    }

    /// Returns true when no server is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.servers.load().is_empty()
    }

    /// Returns true if `server` is in the current list.
    #[must_use]
    pub fn contains(&self, server: &ServerDescriptor) -> bool {
        self.inner.servers.load().contains(server)
    }

    /// Returns the configured discovery endpoint.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.inner.endpoint.as_deref()
    }

    /// Subscribes to list changes.
    ///
    /// The value is a change counter; a burst of changes between two reads
    /// is observed as a single wakeup.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    /// Returns the next server in round-robin order.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::EmptyServerList`] when no server is known.
    pub fn next_server(&self) -> Result<ServerDescriptor> {
        let servers = self.inner.servers.load();
        ensure!(!servers.is_empty(), EmptyServerListSnafu);
        let index = self.inner.cursor.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        Ok(servers[index % servers.len()].clone())
    }

    /// Returns a random server, avoiding `exclude` whenever another one exists.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::EmptyServerList`] when no server is known.
    pub fn random_server(&self, exclude: Option<&ServerDescriptor>) -> Result<ServerDescriptor> {
        let servers = self.inner.servers.load();
        let candidates: Vec<&ServerDescriptor> =
            servers.iter().filter(|s| Some(*s) != exclude).collect();
        let mut rng = rand::rng();
        candidates
            .choose(&mut rng)
            .map(|s| (*s).clone())
            .or_else(|| servers.choose(&mut rng).cloned())
            .ok_or(SdkError::EmptyServerList)
    }

    /// Replaces the list if `servers` is non-empty and differs from the current one.
    ///
    /// Returns true when the list changed.
    pub fn replace_servers(&self, servers: Vec<ServerDescriptor>) -> bool {
        if servers.is_empty() || **self.inner.servers.load() == servers {
            return false;
        }
        info!(count = servers.len(), "server list changed");
        self.inner.servers.store(Arc::new(servers));
        self.inner.changes.send_modify(|version| *version = version.wrapping_add(1));
        true
    }

    /// Fetches the server list if the refresh interval elapsed or the list is empty.
    ///
    /// Returns true when the list changed. Without a discovery endpoint this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the HTTP failure; the current list is kept.
    pub async fn refresh_if_needed(&self) -> Result<bool> {
        let recently_refreshed = self
            .inner
            .last_refresh
            .lock()
            .is_some_and(|at| at.elapsed() < self.inner.min_refresh_interval);
        if recently_refreshed && !self.is_empty() {
            return Ok(false);
        }
        self.refresh().await
    }

    /// Fetches the server list from the discovery endpoint now.
    ///
    /// Returns true when the list changed. Without a discovery endpoint this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the HTTP failure; the current list is kept.
    pub async fn refresh(&self) -> Result<bool> {
        let Some(endpoint) = self.inner.endpoint.as_deref() else {
            return Ok(false);
        };

        let url = server_list_url(endpoint);
        let response = self
            .inner
            .http
            .request(HttpRequest {
                method: HttpMethod::Get,
                url,
                headers: HashMap::new(),
                params: HashMap::new(),
                timeout: self.inner.request_timeout,
            })
            .await?;
        ensure!(response.is_ok(), HttpSnafu { status: response.status, body: response.body });

        let servers = parse_server_list(&response.body, &self.inner.scheme, &self.inner.context_path);
        if servers.is_empty() {
            warn!(endpoint, "discovery returned no usable servers, keeping current list");
            return Ok(false);
        }

        let changed = self.replace_servers(servers);
        if changed {
            *self.inner.last_refresh.lock() = Some(Instant::now());
        }
        Ok(changed)
    }

    /// Stops the background refresh task. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Sends a simple HTTP call to the backend, failing over across servers.
    ///
    /// The access token is added to `params` and every attempt is signed.
    /// With a single server the call is retried up to
    /// [`SINGLE_SERVER_RETRY_TIMES`] times; with several, each server is tried
    /// once in round-robin order from a random start.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::EmptyServerList`] with no servers, or
    /// [`SdkError::RetryExhausted`] naming the attempt count when every attempt failed.
    pub async fn request_with_failover(
        &self,
        api: &str,
        mut params: HashMap<String, String>,
        headers: HashMap<String, String>,
        method: HttpMethod,
        timeout: Duration,
    ) -> Result<String> {
        self.inner.security.inject_access_token(&mut params);
        let servers = self.servers();
        ensure!(!servers.is_empty(), EmptyServerListSnafu);

        let order: Vec<&ServerDescriptor> = if servers.len() == 1 {
            std::iter::repeat_n(&servers[0], SINGLE_SERVER_RETRY_TIMES as usize).collect()
        } else {
            let start = rand::rng().random_range(0..servers.len());
            (0..servers.len()).map(|i| &servers[(start + i) % servers.len()]).collect()
        };

        let mut last_error = None;
        for (attempt, server) in order.iter().enumerate() {
            match self.call_server(server, api, &params, &headers, method, timeout).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    warn!(server = %server, api, attempt = attempt + 1, error = %e, "api request failed");
                    last_error = Some(e);
                },
            }
        }

        Err(SdkError::RetryExhausted {
            attempts: u32::try_from(order.len()).unwrap_or(u32::MAX),
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn call_server(
        &self,
        server: &ServerDescriptor,
        api: &str,
        params: &HashMap<String, String>,
        extra_headers: &HashMap<String, String>,
        method: HttpMethod,
        timeout: Duration,
    ) -> Result<String> {
        let mut headers = extra_headers.clone();
        headers.insert("Client-Version".to_owned(), CLIENT_VERSION.to_owned());
        headers.insert("User-Agent".to_owned(), CLIENT_VERSION.to_owned());
        headers.insert("Connection".to_owned(), "Keep-Alive".to_owned());
        headers.insert("exConfigInfo".to_owned(), "true".to_owned());
        headers.insert("RequestId".to_owned(), uuid::Uuid::new_v4().to_string());
        headers.insert(
            "Content-Type".to_owned(),
            "application/x-www-form-urlencoded;charset=utf-8".to_owned(),
        );
        self.inner.security.inject_access_key(&mut headers);
        if let Some(secret_key) = self.inner.security.secret_key().filter(|k| !k.is_empty()) {
            let tenant = params.get("tenant").map_or("", String::as_str);
            let group = params.get("group").map_or("", String::as_str);
            headers.extend(security::sign_headers(
                tenant,
                group,
                &secret_key,
                security::current_millis(),
            ));
        }

        let response = self
            .inner
            .http
            .request(HttpRequest {
                method,
                url: server.api_url(api),
                headers,
                params: params.clone(),
                timeout,
            })
            .await?;
        ensure!(response.is_ok(), HttpSnafu { status: response.status, body: response.body });
        Ok(response.body)
    }

    fn start_refresh_task(&self, poll_interval: Duration) {
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            debug!("server registry dropped, stopping refresh task");
                            break;
                        };
                        let registry = ServerRegistry { inner };
                        if let Err(e) = registry.refresh_if_needed().await {
                            warn!(error = %e, "server list refresh failed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("server registry refresh task shutting down");
                        break;
                    }
                }
            }
        });
    }
}

fn default_security() -> Arc<dyn SecurityProvider> {
    Arc::new(NoopSecurityProvider)
}
