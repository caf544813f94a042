//! Entry point that owns the server registry and caches RPC clients.
//!
//! One manager per application. Clients are keyed by `"{uid}-{task_id}"`,
//! where `uid` is a random id drawn when the manager is built, so two managers
//! in one process never share clients.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tracing::{debug, info};

use crate::{
    client::{ClientState, RpcClient},
    config::{ClientConfig, ServerConfig},
    error::{Result, SdkError},
    handler::PushHandlerEntry,
    http::{HttpAgent, ReqwestHttpAgent},
    message::{ResponseRegistry, RpcRequest, RpcResponse},
    metrics::{RequestMetrics, default_metrics},
    security::{self, SecurityProvider, StaticSecurityProvider},
    server::{ServerDescriptor, ServerRegistry},
    transport::{Connector, GrpcConnector},
};

/// Header naming the calling application.
pub const CLIENT_APPNAME_HEADER: &str = "Client-AppName";
/// Header carrying the request timestamp in milliseconds.
pub const CLIENT_REQUEST_TS_HEADER: &str = "Client-RequestTS";
/// Header carrying `md5(timestamp + app_key)`.
pub const CLIENT_REQUEST_TOKEN_HEADER: &str = "Client-RequestToken";
/// Header asking the server for extended config info.
pub const EX_CONFIG_INFO_HEADER: &str = "exConfigInfo";
/// Header naming the body charset.
pub const CHARSET_HEADER: &str = "charset";

/// Label naming the component that created a connection.
pub const LABEL_SOURCE: &str = "source";
/// Label naming the functional module of a connection.
pub const LABEL_MODULE: &str = "module";
/// Label carrying the task id.
pub const LABEL_TASK_ID: &str = "taskId";

const PROTOCOL_GRPC: &str = "grpc";
const DEFAULT_TASK_ID: &str = "0";

/// Creates, caches and closes [`RpcClient`]s, and decorates their requests
/// with identity and security headers.
#[derive(Debug)]
pub struct RpcClientManager {
    uid: String,
    config: ClientConfig,
    registry: ServerRegistry,
    connector: Arc<dyn Connector>,
    security: Arc<dyn SecurityProvider>,
    metrics: Arc<dyn RequestMetrics>,
    responses: Arc<ResponseRegistry>,
    clients: DashMap<String, RpcClient>,
}

#[bon::bon]
impl RpcClientManager {
    /// Builds a manager and its server registry.
    ///
    /// Collaborators left unset get production defaults: a tonic connector,
    /// a reqwest HTTP agent, static keys from `client_config`, no-op metrics.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::ConfigInvalid`](crate::SdkError::ConfigInvalid) for
    /// an invalid config, an invalid server entry, or when neither servers nor
    /// a discovery endpoint are configured.
    #[builder]
    pub async fn new(
        client_config: ClientConfig,
        #[builder(default)] server_configs: Vec<ServerConfig>,
        connector: Option<Arc<dyn Connector>>,
        http_agent: Option<Arc<dyn HttpAgent>>,
        security: Option<Arc<dyn SecurityProvider>>,
        metrics: Option<Arc<dyn RequestMetrics>>,
        responses: Option<ResponseRegistry>,
    ) -> Result<Self> {
        client_config.validate()?;
        for server in &server_configs {
            server.validate()?;
        }

        let http_agent = match http_agent {
            Some(agent) => agent,
            None => Arc::new(ReqwestHttpAgent::new(client_config.connect_timeout)?),
        };
        let security = security.unwrap_or_else(|| {
            Arc::new(StaticSecurityProvider::new(
                client_config.access_key.clone(),
                client_config.secret_key.clone(),
            ))
        });
        let connector = connector
            .unwrap_or_else(|| Arc::new(GrpcConnector::new(client_config.connect_timeout)));

        let registry = ServerRegistry::builder()
            .servers(server_configs.iter().map(ServerDescriptor::from).collect())
            .maybe_endpoint(client_config.discovery_endpoint().map(str::to_owned))
            .context_path(client_config.context_path.clone())
            .min_refresh_interval(client_config.server_refresh_interval)
            .request_timeout(client_config.timeout)
            .http_agent(http_agent)
            .security(Arc::clone(&security))
            .build()
            .await?;

        let uid = uuid::Uuid::new_v4().to_string();
        info!(uid = %uid, servers = registry.len(), "rpc client manager created");
        Ok(Self {
            uid,
            config: client_config,
            registry,
            connector,
            security,
            metrics: metrics.unwrap_or_else(default_metrics),
            responses: Arc::new(responses.unwrap_or_default()),
            clients: DashMap::new(),
        })
    }
}

impl RpcClientManager {
    /// Random id scoping this manager's client keys.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Returns the client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the server registry shared by every client.
    #[must_use]
    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Number of cached clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Returns the client for `task_id`, creating and starting it if needed.
    ///
    /// The `labels` and `handlers` only apply when the client is first
    /// started. When another task is starting the same client, the call waits
    /// for that start, up to the configured timeout, and retries it if it
    /// failed. A client whose start failed stays cached and is started again
    /// on the next call.
    ///
    /// # Errors
    ///
    /// Returns the start error when no server could be reached, and
    /// [`SdkError::Timeout`] when a concurrent start outlasts the timeout.
    pub async fn create_or_get_rpc_client(
        &self,
        task_id: &str,
        labels: HashMap<String, String>,
        handlers: Vec<PushHandlerEntry>,
    ) -> Result<RpcClient> {
        let key = format!("{}-{task_id}", self.uid);
        let client = self
            .clients
            .entry(key.clone())
            .or_insert_with(|| self.new_client(&key, task_id, labels))
            .clone();

        if client.state() == ClientState::Uninitialized {
            for entry in handlers {
                let message_type = entry.message_type();
                if !client.register_push_handler(entry) {
                    debug!(client = %client.name(), message_type, "built-in push handler kept");
                }
            }
        }
        self.ensure_started(&client).await?;
        Ok(client)
    }

    /// Starts `client`, or waits for a start already in flight on another task.
    async fn ensure_started(&self, client: &RpcClient) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.timeout;
        loop {
            match client.state() {
                ClientState::Uninitialized => client.start().await?,
                ClientState::Starting => {
                    let mut state = client.watch_state();
                    let settled = tokio::time::timeout_at(
                        deadline,
                        state.wait_for(|s| *s != ClientState::Starting),
                    )
                    .await;
                    match settled {
                        Ok(Ok(_)) => {},
                        Ok(Err(_)) => return Err(SdkError::Shutdown),
                        Err(_) => return Err(SdkError::timeout(self.config.timeout)),
                    }
                },
                _ => return Ok(()),
            }
        }
    }

    /// [`create_or_get_rpc_client`](Self::create_or_get_rpc_client) for the
    /// default task `"0"`.
    ///
    /// # Errors
    ///
    /// Returns the start error when no server could be reached.
    pub async fn get_rpc_client(
        &self,
        labels: HashMap<String, String>,
        handlers: Vec<PushHandlerEntry>,
    ) -> Result<RpcClient> {
        self.create_or_get_rpc_client(DEFAULT_TASK_ID, labels, handlers).await
    }

    fn new_client(&self, key: &str, task_id: &str, labels: HashMap<String, String>) -> RpcClient {
        RpcClient::builder()
            .name(key)
            .tenant(self.config.namespace_id.clone())
            .labels(client_labels(task_id, labels))
            .registry(self.registry.clone())
            .connector(Arc::clone(&self.connector))
            .responses(Arc::clone(&self.responses))
            .metrics(Arc::clone(&self.metrics))
            .client_ip(self.config.client_ip.clone())
            .retry_policy(self.config.retry_policy.clone())
            .timeout(self.config.timeout)
            .keep_alive_interval(self.config.keep_alive_interval)
            .build()
    }

    /// Sends `request` through `client` after injecting security and common
    /// headers, and records the outcome's latency.
    ///
    /// With a secret key configured the call is also signed: `Timestamp` and
    /// `Spas-Signature` cover the request's [`resource`](RpcRequest::resource).
    ///
    /// # Errors
    ///
    /// Returns any error from [`RpcClient::request`].
    pub async fn request(
        &self,
        client: &RpcClient,
        request: &mut dyn RpcRequest,
        timeout: Duration,
    ) -> Result<Box<dyn RpcResponse>> {
        let started = Instant::now();
        let now = security::current_millis();
        let signature = self.security.secret_key().filter(|k| !k.is_empty()).map(|secret| {
            let (tenant, group) = request.resource();
            security::sign_headers(tenant, group, &secret, now)
        });

        let headers = request.headers_mut();
        self.security.inject_access_token(headers);
        self.inject_common_headers(headers, now);
        if let Some(signature) = signature {
            headers.extend(signature);
        }
        self.security.inject_access_key(headers);

        let result = client.request(&*request, timeout).await;
        let code = match &result {
            Ok(response) => response.base().result_code.to_string(),
            Err(e) => e.metric_label().to_owned(),
        };
        self.metrics.observe_request(PROTOCOL_GRPC, request.request_type(), &code, started.elapsed());
        result
    }

    fn inject_common_headers(&self, headers: &mut HashMap<String, String>, now: i64) {
        let now = now.to_string();
        headers.insert(CLIENT_APPNAME_HEADER.to_owned(), self.config.app_name.clone());
        headers.insert(
            CLIENT_REQUEST_TOKEN_HEADER.to_owned(),
            security::request_token(&now, &self.config.app_key),
        );
        headers.insert(CLIENT_REQUEST_TS_HEADER.to_owned(), now);
        headers.insert(EX_CONFIG_INFO_HEADER.to_owned(), "true".to_owned());
        headers.insert(CHARSET_HEADER.to_owned(), "utf-8".to_owned());
    }

    /// Shuts `client` down and evicts it from the cache.
    pub async fn close(&self, client: &RpcClient) {
        client.shutdown().await;
        self.clients.remove(client.name());
    }

    /// Shuts down every cached client and stops the registry's refresh task.
    pub async fn shutdown(&self) {
        let clients: Vec<RpcClient> = self.clients.iter().map(|c| c.value().clone()).collect();
        self.clients.clear();
        for client in clients {
            client.shutdown().await;
        }
        self.registry.shutdown();
        info!(uid = %self.uid, "rpc client manager shut down");
    }
}

/// Default connection labels for a managed client, overridden by `labels`.
fn client_labels(task_id: &str, labels: HashMap<String, String>) -> HashMap<String, String> {
    let mut merged = HashMap::from([
        (LABEL_SOURCE.to_owned(), "sdk".to_owned()),
        (LABEL_MODULE.to_owned(), "config".to_owned()),
        (LABEL_TASK_ID.to_owned(), task_id.to_owned()),
    ]);
    merged.extend(labels);
    merged
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use xgrpc_test_utils::strategies::arb_labels;

    use super::*;
    use crate::{
        error::SdkError,
        message::{HealthCheckRequest, HealthCheckResponse, RequestBase, RequestMessage, ResponseBase},
        mock::{MockConnector, MockHttpAgent, MockServer, Reply},
        security::NoopSecurityProvider,
    };

    #[derive(Debug, Default)]
    struct RecordingMetrics {
        observed: Mutex<Vec<(String, String, String)>>,
    }

    impl RequestMetrics for RecordingMetrics {
        fn observe_request(&self, protocol: &str, request_type: &str, code: &str, _: Duration) {
            self.observed.lock().push((protocol.to_owned(), request_type.to_owned(), code.to_owned()));
        }
    }

    async fn manager(server: &MockServer, metrics: Arc<RecordingMetrics>) -> RpcClientManager {
        let config = ClientConfig::builder()
            .namespace_id("public")
            .app_name("billing")
            .app_key("k3y")
            .access_key("AK".to_owned())
            .secret_key("SK".to_owned())
            .build()
            .unwrap();
        let descriptor = server.descriptor();
        RpcClientManager::builder()
            .client_config(config)
            .server_configs(vec![
                ServerConfig::builder()
                    .ip_addr(descriptor.host())
                    .port(descriptor.port())
                    .build()
                    .unwrap(),
            ])
            .connector(Arc::new(MockConnector::new([server.clone()])))
            .http_agent(Arc::new(MockHttpAgent::new()))
            .metrics(metrics)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn construction_requires_servers_or_endpoint() {
        let err = RpcClientManager::builder()
            .client_config(ClientConfig::default())
            .http_agent(Arc::new(MockHttpAgent::new()))
            .security(Arc::new(NoopSecurityProvider))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn clients_are_cached_per_task_id() {
        let server = MockServer::new("10.0.0.1", 8848);
        let manager = manager(&server, Arc::default()).await;

        let first = manager.create_or_get_rpc_client("7", HashMap::new(), Vec::new()).await.unwrap();
        let again = manager.create_or_get_rpc_client("7", HashMap::new(), Vec::new()).await.unwrap();
        let other = manager.get_rpc_client(HashMap::new(), Vec::new()).await.unwrap();

        assert_eq!(first.name(), format!("{}-7", manager.uid()));
        assert_eq!(first.name(), again.name());
        assert_eq!(other.name(), format!("{}-0", manager.uid()));
        assert_eq!(manager.client_count(), 2);
        assert_eq!(server.connect_count(), 2);
    }

    #[tokio::test]
    async fn labels_carry_identity_and_caller_labels() {
        let server = MockServer::new("10.0.0.1", 8848);
        let manager = manager(&server, Arc::default()).await;
        let labels = HashMap::from([("app".to_owned(), "billing".to_owned())]);

        let client = manager.create_or_get_rpc_client("3", labels, Vec::new()).await.unwrap();
        assert_eq!(client.labels()["source"], "sdk");
        assert_eq!(client.labels()["module"], "config");
        assert_eq!(client.labels()["taskId"], "3");
        assert_eq!(client.labels()["app"], "billing");
        assert_eq!(client.tenant(), "public");
    }

    #[tokio::test]
    async fn request_injects_headers_and_records_latency() {
        let server = MockServer::new("10.0.0.1", 8848);
        let metrics = Arc::new(RecordingMetrics::default());
        let manager = manager(&server, Arc::clone(&metrics)).await;
        let client = manager.get_rpc_client(HashMap::new(), Vec::new()).await.unwrap();

        let mut request = HealthCheckRequest::default();
        manager.request(&client, &mut request, Duration::from_secs(1)).await.unwrap();

        let sent = server
            .requests()
            .into_iter()
            .find(|p| p.message_type() == HealthCheckRequest::TYPE)
            .unwrap();
        let headers = &sent.metadata.as_ref().unwrap().headers;
        let ts = &headers[CLIENT_REQUEST_TS_HEADER];
        assert_eq!(headers[CLIENT_APPNAME_HEADER], "billing");
        assert_eq!(headers[CLIENT_REQUEST_TOKEN_HEADER], security::request_token(ts, "k3y"));
        assert_eq!(headers[EX_CONFIG_INFO_HEADER], "true");
        assert_eq!(headers[CHARSET_HEADER], "utf-8");
        assert_eq!(headers[security::ACCESS_KEY_HEADER], "AK");
        assert_eq!(&headers[security::TIMESTAMP_HEADER], ts);
        assert_eq!(headers[security::SIGNATURE_HEADER], security::sign("", ts, "SK"));

        let observed = metrics.observed.lock().clone();
        assert_eq!(
            observed,
            vec![("grpc".to_owned(), "HealthCheckRequest".to_owned(), "200".to_owned())]
        );
    }

    #[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct ConfigQueryRequest {
        #[serde(flatten)]
        base: RequestBase,
        tenant: String,
        group: String,
    }

    impl RequestMessage for ConfigQueryRequest {
        const TYPE: &'static str = "ConfigQueryRequest";

        fn base(&self) -> &RequestBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut RequestBase {
            &mut self.base
        }

        fn sign_target(&self) -> (&str, &str) {
            (&self.tenant, &self.group)
        }
    }

    #[tokio::test]
    async fn request_signature_covers_tenant_and_group() {
        let server = MockServer::new("10.0.0.1", 8848);
        server.respond_with(ConfigQueryRequest::TYPE, |_| {
            Reply::response(HealthCheckResponse { base: ResponseBase::success() })
        });
        let manager = manager(&server, Arc::default()).await;
        let client = manager.get_rpc_client(HashMap::new(), Vec::new()).await.unwrap();

        let mut request = ConfigQueryRequest {
            tenant: "public".to_owned(),
            group: "DEFAULT_GROUP".to_owned(),
            ..Default::default()
        };
        manager.request(&client, &mut request, Duration::from_secs(1)).await.unwrap();

        let sent = server
            .requests()
            .into_iter()
            .find(|p| p.message_type() == ConfigQueryRequest::TYPE)
            .unwrap();
        let headers = &sent.metadata.as_ref().unwrap().headers;
        let ts = &headers[security::TIMESTAMP_HEADER];
        assert_eq!(
            headers[security::SIGNATURE_HEADER],
            security::sign("public+DEFAULT_GROUP", ts, "SK")
        );
    }

    #[tokio::test]
    async fn concurrent_callers_both_get_a_started_client() {
        let server = MockServer::new("10.0.0.1", 8848);
        let manager = Arc::new(manager(&server, Arc::default()).await);
        server.set_connect_delay(Duration::from_millis(100));

        let first = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_rpc_client(HashMap::new(), Vec::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = manager.get_rpc_client(HashMap::new(), Vec::new()).await.unwrap();
        assert_eq!(second.state(), ClientState::Running);

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.name(), second.name());
        assert_eq!(server.connect_count(), 1);

        let mut request = HealthCheckRequest::default();
        manager.request(&second, &mut request, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn waiting_caller_retries_after_concurrent_start_fails() {
        let server = MockServer::new("10.0.0.1", 8848);
        let manager = Arc::new(manager(&server, Arc::default()).await);
        server.set_connect_delay(Duration::from_millis(50));
        server.set_reachable(false);

        let first = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_rpc_client(HashMap::new(), Vec::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_rpc_client(HashMap::new(), Vec::new()).await })
        };
        assert!(first.await.unwrap().is_err());
        server.set_reachable(true);

        let second = second.await.unwrap();
        assert!(second.is_ok_and(|c| c.is_running()));
    }

    #[tokio::test]
    async fn failed_request_is_observed_with_error_label() {
        let server = MockServer::new("10.0.0.1", 8848);
        let metrics = Arc::new(RecordingMetrics::default());
        let manager = manager(&server, Arc::clone(&metrics)).await;
        let client = manager.get_rpc_client(HashMap::new(), Vec::new()).await.unwrap();
        server.set_delay(Duration::from_millis(200));

        let mut request = HealthCheckRequest::default();
        let err = manager.request(&client, &mut request, Duration::from_millis(20)).await.unwrap_err();

        let observed = metrics.observed.lock().clone();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].2, err.metric_label());
    }

    #[tokio::test]
    async fn close_evicts_and_shutdown_stops_everything() {
        let server = MockServer::new("10.0.0.1", 8848);
        let manager = manager(&server, Arc::default()).await;
        let a = manager.create_or_get_rpc_client("a", HashMap::new(), Vec::new()).await.unwrap();
        let b = manager.create_or_get_rpc_client("b", HashMap::new(), Vec::new()).await.unwrap();

        manager.close(&a).await;
        assert_eq!(a.state(), ClientState::Terminated);
        assert_eq!(manager.client_count(), 1);

        let fresh = manager.create_or_get_rpc_client("a", HashMap::new(), Vec::new()).await.unwrap();
        assert!(fresh.is_running());

        manager.shutdown().await;
        assert_eq!(b.state(), ClientState::Terminated);
        assert_eq!(fresh.state(), ClientState::Terminated);
        assert_eq!(manager.client_count(), 0);
        assert!(manager.registry().is_shut_down());
    }

    #[tokio::test]
    async fn failed_start_is_retried_on_next_call() {
        let server = MockServer::new("10.0.0.1", 8848);
        let manager = manager(&server, Arc::default()).await;
        server.set_reachable(false);

        assert!(manager.get_rpc_client(HashMap::new(), Vec::new()).await.is_err());
        assert_eq!(manager.client_count(), 1);

        server.set_reachable(true);
        let client = manager.get_rpc_client(HashMap::new(), Vec::new()).await.unwrap();
        assert!(client.is_running());
    }

    proptest! {
        #[test]
        fn caller_labels_survive_merge(labels in arb_labels(), task in "[0-9]{1,4}") {
            let merged = client_labels(&task, labels.clone());
            for (key, value) in &labels {
                prop_assert_eq!(merged.get(key), Some(value));
            }
            for key in [LABEL_SOURCE, LABEL_MODULE, LABEL_TASK_ID] {
                prop_assert!(merged.contains_key(key));
            }
            if !labels.contains_key(LABEL_TASK_ID) {
                prop_assert_eq!(merged.get(LABEL_TASK_ID), Some(&task));
            }
        }
    }
}
