//! Failover behavior of a running client: failure bursts, discovery-driven
//! server list changes and shutdown under load.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use xgrpc_sdk::{
    ClientEvent, ClientState, ConnectionEvent, HealthCheckRequest, HttpResponse, RetryPolicy,
    RpcClient, SdkError, ServerRegistry,
    mock::{MockConnector, MockEvent, MockHttpAgent, MockServer},
};
use xgrpc_test_utils::assert_eventually;

const WAIT: Duration = Duration::from_secs(2);

fn servers(count: u8) -> Vec<MockServer> {
    (1..=count).map(|i| MockServer::new(&format!("10.2.0.{i}"), 8848)).collect()
}

async fn static_registry(servers: &[MockServer]) -> ServerRegistry {
    ServerRegistry::builder()
        .servers(servers.iter().map(|s| s.descriptor().clone()).collect())
        .http_agent(Arc::new(MockHttpAgent::new()))
        .build()
        .await
        .unwrap()
}

fn client(registry: ServerRegistry, connector: Arc<MockConnector>) -> RpcClient {
    RpcClient::builder()
        .name("failover-test")
        .registry(registry)
        .connector(connector)
        .retry_policy(
            RetryPolicy::builder()
                .initial_backoff(Duration::from_millis(1))
                .max_backoff(Duration::from_millis(5))
                .build(),
        )
        .build()
}

fn current<'a>(servers: &'a [MockServer], client: &RpcClient) -> &'a MockServer {
    let current = client.current_server().unwrap();
    servers.iter().find(|s| *s.descriptor() == current).unwrap()
}

#[tokio::test]
async fn burst_of_connection_failures_causes_exactly_one_switch() {
    let servers = servers(3);
    let connector = Arc::new(MockConnector::new(servers.clone()));
    let client = client(static_registry(&servers).await, Arc::clone(&connector));
    client.start().await.unwrap();
    let origin = current(&servers, &client).clone();
    origin.inject_unavailable(16);

    let request = HealthCheckRequest::default();
    let results =
        join_all((0..16).map(|_| client.request(&request, Duration::from_secs(1)))).await;
    assert!(results.iter().any(Result::is_err));

    assert!(assert_eventually(WAIT, || client.switch_count() == 1).await);
    assert!(assert_eventually(WAIT, || client.state() == ClientState::Running).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.switch_count(), 1);
    assert_eq!(connector.connect_count(), 2);
    assert_ne!(client.current_server().as_ref(), Some(origin.descriptor()));

    client.request(&request, Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn switch_opens_new_connection_before_closing_old() {
    let servers = servers(2);
    let connector = Arc::new(MockConnector::new(servers.clone()));
    let client = client(static_registry(&servers).await, Arc::clone(&connector));
    client.start().await.unwrap();
    let origin = client.current_server().unwrap();
    let mut events = client.subscribe_events();

    assert!(client.switch_server_async(None, true));
    assert!(assert_eventually(WAIT, || client.switch_count() == 1).await);

    let first: ClientEvent = events.recv().await.unwrap();
    let second: ClientEvent = events.recv().await.unwrap();
    assert_eq!(first.kind, ConnectionEvent::Connected);
    assert_eq!(second.kind, ConnectionEvent::Disconnected);
    assert_eq!(second.server, origin);

    let log = connector.events();
    assert_eq!(
        &log[1..],
        &[MockEvent::Connected(first.server.address()), MockEvent::Closed(origin.address())]
    );
}

#[tokio::test]
async fn discovery_update_moves_client_off_removed_server() {
    let servers = servers(2);
    let body = |list: &[&MockServer]| -> String {
        list.iter().map(|s| format!("{}:{}\n", s.descriptor().host(), s.descriptor().port())).collect()
    };
    let agent = Arc::new(MockHttpAgent::new());
    agent.set_default_response(HttpResponse { status: 200, body: body(&[&servers[0], &servers[1]]) });

    let registry = ServerRegistry::builder()
        .endpoint("discovery.local:8080".to_owned())
        .min_refresh_interval(Duration::from_millis(10))
        .poll_interval(Duration::from_millis(20))
        .http_agent(agent.clone())
        .build()
        .await
        .unwrap();
    assert_eq!(registry.len(), 2);

    let client = client(registry.clone(), Arc::new(MockConnector::new(servers.clone())));
    client.start().await.unwrap();
    let origin = current(&servers, &client).clone();
    let survivor = servers.iter().find(|s| s.descriptor() != origin.descriptor()).unwrap();

    agent.set_default_response(HttpResponse { status: 200, body: body(&[survivor]) });

    assert!(assert_eventually(WAIT, || client.switch_count() == 1).await);
    assert_eq!(client.current_server().as_ref(), Some(survivor.descriptor()));
    assert_eq!(origin.close_count(), 1);

    client.shutdown().await;
    registry.shutdown();
}

#[tokio::test]
async fn failed_switch_keeps_serving_on_old_connection() {
    let servers = servers(3);
    let client = client(static_registry(&servers).await, Arc::new(MockConnector::new(servers.clone())));
    client.start().await.unwrap();
    let origin = current(&servers, &client).clone();
    for server in servers.iter().filter(|s| s.descriptor() != origin.descriptor()) {
        server.set_reachable(false);
    }
    let mut events = client.subscribe_events();

    assert!(client.switch_server_async(None, true));
    assert!(assert_eventually(WAIT, || client.state() == ClientState::Running).await);

    assert_eq!(client.switch_count(), 0);
    assert_eq!(client.current_server().as_ref(), Some(origin.descriptor()));
    assert_eq!(events.recv().await.unwrap().kind, ConnectionEvent::Failed);
    assert_eq!(events.recv().await.unwrap().kind, ConnectionEvent::Failed);
    client.request(&HealthCheckRequest::default(), Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn shutdown_does_not_strand_requests() {
    let servers = servers(1);
    let client = client(static_registry(&servers).await, Arc::new(MockConnector::new(servers.clone())));
    client.start().await.unwrap();
    servers[0].set_delay(Duration::from_millis(100));

    let inflight = {
        let client = client.clone();
        tokio::spawn(async move {
            client.request(&HealthCheckRequest::default(), Duration::from_secs(5)).await.map(|_| ())
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.shutdown().await;

    // The in-flight call may succeed or fail, but it must finish.
    let _ = tokio::time::timeout(Duration::from_secs(1), inflight).await.unwrap().unwrap();
    let err =
        client.request(&HealthCheckRequest::default(), Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, SdkError::NotRunning { .. }));
    assert_eq!(servers[0].close_count(), 1);
}
