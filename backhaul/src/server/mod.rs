// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Public HTTP surface of the relay.
//!
//! Every transport shares the proxy, health, and listing routes; the push or
//! pull peer routes are mounted according to the configured mode.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context as AnyhowContext, Result};
use axum::{
  routing::{any, get, post},
  Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
  cors::{Any, CorsLayer},
  trace::TraceLayer,
};

use crate::common::{
  authentication,
  daemon::RelayDaemon,
  protocol::transport::TransportMode,
};

pub mod config;
pub mod error;
mod proxy;
mod pull;
mod push;
pub mod rate_limit;

pub use config::ServerConfig;
pub use error::ApiError;
use rate_limit::ProxyRateLimiter;

/// State shared by every route
pub struct AppState {
  pub daemon: Arc<RelayDaemon>,
  pub config: ServerConfig,
  pub rate_limiter: ProxyRateLimiter,
}

impl AppState {
  pub fn new(daemon: Arc<RelayDaemon>, config: ServerConfig) -> Self {
    let rate_limiter = ProxyRateLimiter::new(config.rate_limit_window, config.rate_limit_max);
    Self {
      daemon,
      config,
      rate_limiter,
    }
  }

  pub(crate) fn authenticate(&self, headers: &axum::http::HeaderMap) -> Result<(), ApiError> {
    let presented = authentication::presented_credential(headers);
    self
      .daemon
      .authentication_handler()
      .authenticate(presented)
      .map_err(|error| {
        tracing::warn!(%error, "Rejected unauthenticated request");
        ApiError::Unauthorized
      })
  }
}

/// Builds the relay's routes for the configured transport mode
pub fn build_router(state: Arc<AppState>) -> Router {
  let cors = CorsLayer::new()
    .allow_origin(Any)
    .allow_methods(Any)
    .allow_headers(Any);

  let router = Router::new()
    .route("/health", get(proxy::health))
    .route("/clients", get(proxy::clients))
    .route("/api/:connection_id", any(proxy::forward))
    .route("/api/:connection_id/*rest", any(proxy::forward));

  let router = match state.daemon.mode() {
    TransportMode::Push => router.route(
      &state.config.normalized_socket_path(),
      get(push::upgrade),
    ),
    TransportMode::Pull => router
      .route("/register", post(pull::register))
      .route("/heartbeat/:connection_id", post(pull::heartbeat))
      .route("/poll/:connection_id", get(pull::poll))
      .route("/response/:connection_id", post(pull::post_response)),
  };

  router
    .layer(TraceLayer::new_for_http())
    .layer(cors)
    .with_state(state)
}

pub fn daemon_for(config: &ServerConfig) -> Arc<RelayDaemon> {
  let authentication_handler = authentication::handler_for_key(config.api_key.as_deref());
  Arc::new(RelayDaemon::new(
    config.transport_mode,
    authentication_handler,
    config.request_timeout,
  ))
}

/// A relay server bound to its listening socket
pub struct RelayServer {
  listener: TcpListener,
  state: Arc<AppState>,
}

impl RelayServer {
  pub async fn bind(config: ServerConfig) -> Result<Self> {
    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr)
      .await
      .with_context(|| format!("Failed to bind relay server to {}", addr))?;
    let daemon = daemon_for(&config);
    Ok(Self {
      listener,
      state: Arc::new(AppState::new(daemon, config)),
    })
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    self
      .listener
      .local_addr()
      .context("Listener has no local address")
  }

  pub fn daemon(&self) -> &Arc<RelayDaemon> {
    &self.state.daemon
  }

  /// Serves until `shutdown` fires, then evicts every peer
  #[tracing::instrument(skip(self, shutdown), fields(addr = ?self.listener.local_addr().ok(), mode = %self.state.daemon.mode()), err)]
  pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
    let RelayServer { listener, state } = self;
    let daemon = Arc::clone(&state.daemon);
    if daemon.authentication_handler().is_open() {
      tracing::warn!("API_KEY is not set; the relay is running without API key protection");
    }

    let liveness = daemon.run(state.config.ping_interval, shutdown.clone());
    let limiter_cleanup = {
      let state = Arc::clone(&state);
      let shutdown = shutdown.clone();
      tokio::task::spawn(async move {
        let mut ticker =
          tokio::time::interval(state.config.rate_limit_window.max(Duration::from_secs(1)));
        loop {
          tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => state.rate_limiter.retain_recent(),
          }
        }
      })
    };

    let router = build_router(state);
    tracing::info!("Relay server listening");
    let served = axum::serve(
      listener,
      router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
      let shutdown = shutdown.clone();
      async move { shutdown.cancelled().await }
    })
    .await
    .context("Relay server failed");

    // The server may also stop on its own; make sure the background tasks follow
    shutdown.cancel();
    let _ = limiter_cleanup.await;
    liveness
      .await
      .map_err(|_| anyhow::Error::msg("Liveness monitor panicked and lost context"))?;
    served
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
  };
  use serde_json::Value;
  use tower::ServiceExt;

  use super::{build_router, daemon_for, AppState, ServerConfig};
  use crate::common::protocol::transport::TransportMode;

  fn relay(config: ServerConfig) -> (Router, Arc<AppState>) {
    let daemon = daemon_for(&config);
    let state = Arc::new(AppState::new(daemon, config));
    (build_router(Arc::clone(&state)), state)
  }

  async fn json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
  }

  fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
  }

  #[tokio::test]
  async fn health_reports_waiting_then_ready() {
    let (router, state) = relay(ServerConfig::default());
    let response = router.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connectedClients"], 0);
    assert_eq!(body["message"], "Waiting for remote clients to connect");

    let (_session, _endpoint) = state.daemon.register_push();
    let body = json(router.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(body["connectedClients"], 1);
    assert_eq!(body["message"], "Ready to proxy requests");
  }

  #[tokio::test]
  async fn unknown_connection_is_not_found() {
    let (router, _state) = relay(ServerConfig::default());
    let response = router.oneshot(get("/api/7/users")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json(response).await;
    assert_eq!(body["error"], "Remote client not connected");

    let (router, _state) = relay(ServerConfig::default());
    let response = router.oneshot(get("/api/not-a-number/users")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
  }

  #[tokio::test]
  async fn proxy_requires_the_configured_key() {
    let config = ServerConfig {
      api_key: Some("s3cret".into()),
      ..Default::default()
    };
    let (router, _state) = relay(config);
    let response = router.clone().oneshot(get("/api/1/users")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json(response).await["message"], "Valid API Key required");

    let request = Request::builder()
      .uri("/api/1/users")
      .header("authorization", "Bearer s3cret")
      .body(Body::empty())
      .unwrap();
    // Authenticated, but nobody is connected
    assert_eq!(router.clone().oneshot(request).await.unwrap().status(), StatusCode::NOT_FOUND);

    let request = Request::builder()
      .uri("/api/1/users")
      .header("x-api-key", "wrong")
      .body(Body::empty())
      .unwrap();
    assert_eq!(router.oneshot(request).await.unwrap().status(), StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn proxy_is_rate_limited() {
    let config = ServerConfig {
      rate_limit_max: 2,
      ..Default::default()
    };
    let (router, _state) = relay(config);
    for _ in 0..2 {
      let response = router.clone().oneshot(get("/api/1/x")).await.unwrap();
      assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
    let response = router.oneshot(get("/api/1/x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json(response).await["error"], "Too Many Requests");
  }

  #[tokio::test]
  async fn pull_routes_carry_an_exchange_end_to_end() {
    let config = ServerConfig {
      transport_mode: TransportMode::Pull,
      ..Default::default()
    };
    let (router, state) = relay(config);

    let response = router
      .clone()
      .oneshot(Request::post("/register").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let id = json(response).await["connectionId"].as_u64().unwrap();

    let empty = router
      .clone()
      .oneshot(get(&format!("/poll/{}?wait=10", id)))
      .await
      .unwrap();
    assert_eq!(empty.status(), StatusCode::NO_CONTENT);

    let public = tokio::spawn({
      let router = router.clone();
      let request = Request::post(format!("/api/{}/items?page=2", id))
        .header("content-type", "application/json")
        .body(Body::from(r#"{"name":"widget"}"#))
        .unwrap();
      async move { router.oneshot(request).await.unwrap() }
    });

    let delivered = router
      .clone()
      .oneshot(get(&format!("/poll/{}?wait=5000", id)))
      .await
      .unwrap();
    assert_eq!(delivered.status(), StatusCode::OK);
    let descriptor = json(delivered).await;
    assert_eq!(descriptor["method"], "POST");
    assert_eq!(descriptor["path"], "/items?page=2");
    assert_eq!(descriptor["query"]["page"], "2");
    assert_eq!(descriptor["body"]["name"], "widget");

    let reply = serde_json::json!({
      "requestId": descriptor["requestId"],
      "statusCode": 201,
      "headers": {"content-type": "application/json", "x-served-by": "agent"},
      "body": {"created": true},
    });
    let posted = router
      .clone()
      .oneshot(
        Request::post(format!("/response/{}", id))
          .header("content-type", "application/json")
          .body(Body::from(reply.to_string()))
          .unwrap(),
      )
      .await
      .unwrap();
    assert_eq!(posted.status(), StatusCode::NO_CONTENT);

    let response = public.await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["x-served-by"], "agent");
    assert_eq!(json(response).await["created"], true);

    let listing = json(router.clone().oneshot(get("/clients")).await.unwrap()).await;
    assert_eq!(listing["connectedClients"][0]["id"], id);
    assert_eq!(listing["connectedClients"][0]["pendingRequests"], 0);

    let heartbeat = router
      .clone()
      .oneshot(Request::post(format!("/heartbeat/{}", id)).body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(heartbeat.status(), StatusCode::NO_CONTENT);

    state.daemon.evict(
      crate::common::protocol::ConnectionId::new(id),
      crate::common::protocol::TunnelCloseReason::LivenessTimeout,
    );
    let gone = router
      .oneshot(get(&format!("/poll/{}?wait=10", id)))
      .await
      .unwrap();
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
  }

  async fn register(router: &Router) -> u64 {
    let response = router
      .clone()
      .oneshot(Request::post("/register").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    json(response).await["connectionId"].as_u64().unwrap()
  }

  #[tokio::test]
  async fn timed_out_request_is_not_polled_afterwards() {
    let config = ServerConfig {
      transport_mode: TransportMode::Pull,
      request_timeout: Duration::from_millis(100),
      ..Default::default()
    };
    let (router, state) = relay(config);
    let id = register(&router).await;

    let response = router
      .clone()
      .oneshot(
        Request::post(format!("/api/{}/charge", id))
          .header("content-type", "application/json")
          .body(Body::from(r#"{"amount":5}"#))
          .unwrap(),
      )
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json(response).await["error"], "Gateway Timeout");

    let poll = router
      .oneshot(get(&format!("/poll/{}?wait=10", id)))
      .await
      .unwrap();
    assert_eq!(poll.status(), StatusCode::NO_CONTENT);
    let connection = state
      .daemon
      .registry()
      .get(crate::common::protocol::ConnectionId::new(id))
      .unwrap();
    assert_eq!(connection.undelivered_count(), 0);
    assert_eq!(connection.pending_count(), 0);
  }

  #[tokio::test]
  async fn binary_bodies_cross_the_relay_unchanged() {
    let config = ServerConfig {
      transport_mode: TransportMode::Pull,
      ..Default::default()
    };
    let (router, _state) = relay(config);
    let id = register(&router).await;

    let upload: Vec<u8> = vec![0x1f, 0x8b, 0x08, 0x00, 0xff, 0xfe, 0x00, 0x80];
    let public = tokio::spawn({
      let router = router.clone();
      let request = Request::put(format!("/api/{}/blob", id))
        .header("content-type", "application/octet-stream")
        .body(Body::from(upload.clone()))
        .unwrap();
      async move { router.oneshot(request).await.unwrap() }
    });

    let delivered = router
      .clone()
      .oneshot(get(&format!("/poll/{}?wait=5000", id)))
      .await
      .unwrap();
    let descriptor = json(delivered).await;
    assert_eq!(descriptor["bodyEncoding"], "base64");

    // Echo the body back exactly as the agent received it
    let reply = serde_json::json!({
      "requestId": descriptor["requestId"],
      "statusCode": 200,
      "headers": {"content-type": "application/gzip", "content-encoding": "gzip"},
      "body": descriptor["body"],
      "bodyEncoding": "base64",
    });
    let posted = router
      .clone()
      .oneshot(
        Request::post(format!("/response/{}", id))
          .body(Body::from(reply.to_string()))
          .unwrap(),
      )
      .await
      .unwrap();
    assert_eq!(posted.status(), StatusCode::NO_CONTENT);

    let response = public.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-encoding"], "gzip");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.as_ref(), upload.as_slice());
  }

  #[tokio::test]
  async fn parked_poll_sees_gone_on_eviction() {
    let config = ServerConfig {
      transport_mode: TransportMode::Pull,
      ..Default::default()
    };
    let (router, state) = relay(config);
    let connection = state.daemon.register_pull();
    let poll = tokio::spawn({
      let router = router.clone();
      let uri = format!("/poll/{}?wait=30000", connection.id());
      async move { router.oneshot(get(&uri)).await.unwrap() }
    });
    while connection.parked_poll_count() == 0 {
      tokio::time::sleep(Duration::from_millis(1)).await;
    }
    state.daemon.evict(
      connection.id(),
      crate::common::protocol::TunnelCloseReason::LivenessTimeout,
    );
    let response = poll.await.unwrap();
    assert_eq!(response.status(), StatusCode::GONE);
  }

  #[tokio::test]
  async fn malformed_result_is_rejected() {
    let config = ServerConfig {
      transport_mode: TransportMode::Pull,
      ..Default::default()
    };
    let (router, state) = relay(config);
    let connection = state.daemon.register_pull();
    let response = router
      .oneshot(
        Request::post(format!("/response/{}", connection.id()))
          .body(Body::from("{not json"))
          .unwrap(),
      )
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn routes_follow_the_transport_mode() {
    let (push_router, _state) = relay(ServerConfig::default());
    let response = push_router
      .oneshot(Request::post("/register").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let config = ServerConfig {
      transport_mode: TransportMode::Pull,
      ..Default::default()
    };
    let (pull_router, _state) = relay(config);
    let response = pull_router.oneshot(get("/ws")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
  }
}
