//! Connects to an xgrpc cluster, installs a custom push handler and issues
//! health checks until interrupted.
//!
//! Run: `cargo run --example demo -- --servers 127.0.0.1:8848,127.0.0.2:8848`
//!
//! This example shows:
//! - Client configuration and log setup from `ClientConfig::log_level`
//! - Getting a started client from the manager
//! - Handling a server push with a custom message type
//! - Following connection events while the client fails over

// Examples are allowed to use expect/unwrap for brevity
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use xgrpc_sdk::{
    ClientConfig, HealthCheckRequest, PushHandlerEntry, RequestBase, RequestMessage, ResponseBase,
    ResponseMessage, Result, RpcClient, RpcClientManager, ServerConfig, ServerRequestHandler,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigChangeNotifyRequest {
    #[serde(flatten)]
    base: RequestBase,
    data_id: String,
    group: String,
}

impl RequestMessage for ConfigChangeNotifyRequest {
    const TYPE: &'static str = "ConfigChangeNotifyRequest";

    fn base(&self) -> &RequestBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RequestBase {
        &mut self.base
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigChangeNotifyResponse {
    #[serde(flatten)]
    base: ResponseBase,
}

impl ResponseMessage for ConfigChangeNotifyResponse {
    const TYPE: &'static str = "ConfigChangeNotifyResponse";

    fn base(&self) -> &ResponseBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ResponseBase {
        &mut self.base
    }
}

struct ConfigChangeLogger;

#[async_trait::async_trait]
impl ServerRequestHandler for ConfigChangeLogger {
    type Request = ConfigChangeNotifyRequest;
    type Response = ConfigChangeNotifyResponse;

    async fn handle(
        &self,
        request: ConfigChangeNotifyRequest,
        client: &RpcClient,
    ) -> Option<ConfigChangeNotifyResponse> {
        println!("[{}] config changed: {}/{}", client.name(), request.group, request.data_id);
        Some(ConfigChangeNotifyResponse::default())
    }
}

fn parse_servers(raw: &str) -> Result<Vec<ServerConfig>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (host, port) = entry.split_once(':').unwrap_or((entry, "8848"));
            ServerConfig::builder()
                .ip_addr(host)
                .port(port.parse().expect("numeric port"))
                .build()
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let servers = args
        .iter()
        .position(|a| a == "--servers")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
        .unwrap_or("127.0.0.1:8848");

    // -------------------------------------------------------------------------
    // 1. Configuration and logging
    // -------------------------------------------------------------------------
    let config = ClientConfig::builder()
        .app_name("xgrpc-demo")
        .timeout(Duration::from_secs(3))
        .log_level("info")
        .build()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("xgrpc_sdk={}", config.log_level))),
        )
        .init();

    // -------------------------------------------------------------------------
    // 2. Manager and a started client with a custom push handler
    // -------------------------------------------------------------------------
    let manager = RpcClientManager::builder()
        .client_config(config)
        .server_configs(parse_servers(servers)?)
        .build()
        .await?;

    let client = manager
        .create_or_get_rpc_client(
            "demo",
            HashMap::from([("role".to_owned(), "example".to_owned())]),
            vec![PushHandlerEntry::new(ConfigChangeLogger)],
        )
        .await?;
    println!(
        "client {} connected to {} (connection {})",
        client.name(),
        client.current_server().map(|s| s.address()).unwrap_or_default(),
        client.connection_id().unwrap_or_default(),
    );

    // -------------------------------------------------------------------------
    // 3. Watch connection events in the background
    // -------------------------------------------------------------------------
    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("connection event: {:?} {}", event.kind, event.server);
        }
    });

    // -------------------------------------------------------------------------
    // 4. Health checks until Ctrl-C
    // -------------------------------------------------------------------------
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let mut request = HealthCheckRequest::default();
                match manager.request(&client, &mut request, Duration::from_secs(3)).await {
                    Ok(response) => println!("health check: code {}", response.base().result_code),
                    Err(e) => println!("health check failed: {e}"),
                }
            },
        }
    }

    manager.shutdown().await;
    println!("client state: {}", client.state());
    Ok(())
}
