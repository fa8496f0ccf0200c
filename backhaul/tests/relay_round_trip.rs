// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Drives a real relay server and agent against a local echo target.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
  body::Bytes,
  http::{HeaderMap, Method, StatusCode, Uri},
  response::IntoResponse,
  routing::any,
  Json, Router,
};
use backhaul::{
  client::{AgentConfig, AgentError, RelayAgent},
  common::{daemon::RelayDaemon, protocol::transport::TransportMode},
  server::{RelayServer, ServerConfig},
  util::cancellation::CancellationListener,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

const KEY: &str = "integration-key";

async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
  let body = serde_json::from_slice::<Value>(&body).unwrap_or(Value::Null);
  let trace = headers
    .get("x-trace")
    .and_then(|value| value.to_str().ok())
    .map(str::to_owned);
  (
    StatusCode::CREATED,
    Json(json!({
      "method": method.as_str(),
      "uri": uri.to_string(),
      "trace": trace,
      "body": body,
    })),
  )
}

async fn spawn_target() -> SocketAddr {
  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let app = Router::new().route("/*path", any(echo));
  tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
  addr
}

struct Relay {
  addr: SocketAddr,
  daemon: Arc<RelayDaemon>,
  shutdown: CancellationToken,
  server: JoinHandle<anyhow::Result<()>>,
}

impl Relay {
  async fn start(mode: TransportMode) -> Self {
    let config = ServerConfig {
      bind_address: "127.0.0.1".parse().unwrap(),
      port: 0,
      api_key: Some(KEY.to_owned()),
      transport_mode: mode,
      request_timeout: Duration::from_secs(5),
      ..Default::default()
    };
    let server = RelayServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let daemon = Arc::clone(server.daemon());
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(server.run(shutdown.clone()));
    Self {
      addr,
      daemon,
      shutdown,
      server,
    }
  }

  fn agent_config(&self, mode: TransportMode, target: SocketAddr, key: &str) -> AgentConfig {
    let server_url = match mode {
      TransportMode::Push => format!("ws://{}/ws", self.addr),
      TransportMode::Pull => format!("http://{}", self.addr),
    };
    let mut config = AgentConfig::new(
      Url::parse(&server_url).unwrap(),
      Url::parse(&format!("http://{}", target)).unwrap(),
    );
    config.transport_mode = mode;
    config.api_key = Some(key.to_owned());
    config.reconnect_interval = Duration::from_millis(100);
    config.poll_wait = Duration::from_secs(2);
    config
  }

  /// Waits for the first agent to register and returns its id
  async fn connected_agent(&self) -> String {
    for _ in 0..250 {
      if let Some(connection) = self.daemon.registry().snapshot().first() {
        return connection.id().to_string();
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("No agent connected to the relay");
  }

  async fn stop(self) {
    self.shutdown.cancel();
    self.server.await.unwrap().unwrap();
  }
}

async fn round_trip(mode: TransportMode) {
  let target = spawn_target().await;
  let relay = Relay::start(mode).await;
  let agent = RelayAgent::new(relay.agent_config(mode, target, KEY)).unwrap();
  let agent_shutdown = CancellationToken::new();
  let agent_task = {
    let listener: CancellationListener = agent_shutdown.clone().into();
    tokio::spawn(async move { agent.run(listener).await })
  };

  let id = relay.connected_agent().await;
  let http = reqwest::Client::new();
  let response = http
    .post(format!("http://{}/api/{}/items/7?expand=true", relay.addr, id))
    .bearer_auth(KEY)
    .header("x-trace", "abc")
    .json(&json!({"name": "widget", "tags": [1, 2]}))
    .send()
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::CREATED);
  assert_eq!(response.headers()["content-type"], "application/json");
  let echoed: Value = response.json().await.unwrap();
  assert_eq!(echoed["method"], "POST");
  assert_eq!(echoed["uri"], "/items/7?expand=true");
  assert_eq!(echoed["trace"], "abc");
  assert_eq!(echoed["body"], json!({"name": "widget", "tags": [1, 2]}));

  // Several requests in flight at once all come back to their own callers
  let calls = (0..5).map(|n| {
    let http = http.clone();
    let url = format!("http://{}/api/{}/n/{}", relay.addr, id, n);
    async move {
      let response = http.get(url).header("x-api-key", KEY).send().await.unwrap();
      let echoed: Value = response.json().await.unwrap();
      (n, echoed)
    }
  });
  for (n, echoed) in futures::future::join_all(calls).await {
    assert_eq!(echoed["uri"], format!("/n/{}", n));
  }

  let missing = http
    .get(format!("http://{}/api/999/anything", relay.addr))
    .bearer_auth(KEY)
    .send()
    .await
    .unwrap();
  assert_eq!(missing.status(), StatusCode::NOT_FOUND);
  let envelope: Value = missing.json().await.unwrap();
  assert_eq!(envelope["error"], "Remote client not connected");

  let anonymous = http
    .get(format!("http://{}/api/{}/items", relay.addr, id))
    .send()
    .await
    .unwrap();
  assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

  agent_shutdown.cancel();
  assert!(agent_task.await.unwrap().is_ok());
  relay.stop().await;
}

#[tokio::test]
async fn push_agent_round_trip() {
  round_trip(TransportMode::Push).await;
}

#[tokio::test]
async fn pull_agent_round_trip() {
  round_trip(TransportMode::Pull).await;
}

async fn rejected_agent_stops(mode: TransportMode) {
  let target = spawn_target().await;
  let relay = Relay::start(mode).await;
  let agent = RelayAgent::new(relay.agent_config(mode, target, "wrong-key")).unwrap();
  let outcome = tokio::time::timeout(
    Duration::from_secs(5),
    agent.run(CancellationToken::new().into()),
  )
  .await
  .expect("agent kept retrying after a rejected key");
  assert!(matches!(outcome, Err(AgentError::Unauthorized)));
  assert!(relay.daemon.registry().is_empty());
  relay.stop().await;
}

#[tokio::test]
async fn push_agent_with_wrong_key_stops() {
  rejected_agent_stops(TransportMode::Push).await;
}

#[tokio::test]
async fn pull_agent_with_wrong_key_stops() {
  rejected_agent_stops(TransportMode::Pull).await;
}

#[tokio::test]
async fn unreachable_target_yields_server_error() {
  // Bind and drop a listener to find a port nothing answers on
  let dead_target = {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
  };
  let relay = Relay::start(TransportMode::Push).await;
  let agent = RelayAgent::new(relay.agent_config(TransportMode::Push, dead_target, KEY)).unwrap();
  let agent_shutdown = CancellationToken::new();
  let agent_task = {
    let listener: CancellationListener = agent_shutdown.clone().into();
    tokio::spawn(async move { agent.run(listener).await })
  };

  let id = relay.connected_agent().await;
  let response = reqwest::Client::new()
    .get(format!("http://{}/api/{}/health", relay.addr, id))
    .bearer_auth(KEY)
    .send()
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
  let envelope: Value = response.json().await.unwrap();
  assert_eq!(envelope["error"], "Internal Server Error");

  agent_shutdown.cancel();
  assert!(agent_task.await.unwrap().is_ok());
  relay.stop().await;
}
