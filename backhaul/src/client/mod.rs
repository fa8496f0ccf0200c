// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The relay agent, running next to the private target.
//!
//! The agent dials out to the relay, receives request descriptors, replays
//! them against the target, and ships the results back. Transport loss is
//! followed by a fixed delay and a fresh session.

use std::{sync::Arc, time::Duration};

use url::Url;

use crate::{
  common::protocol::{
    descriptor::{RequestDescriptor, ResponseDescriptor},
    transport::TransportMode,
  },
  util::cancellation::CancellationListener,
};

pub mod outbound;
mod pull;
mod push;

pub use outbound::{OutboundError, OutboundHttp, ReqwestOutbound};

#[derive(thiserror::Error, Debug)]
pub enum AgentError {
  #[error("The relay rejected the API key")]
  Unauthorized,
  #[error("Invalid relay configuration: {0}")]
  InvalidConfiguration(String),
  #[error("Failed to connect to the relay: {0}")]
  Connect(String),
  #[error("Connection to the relay was lost: {0}")]
  Transport(String),
  #[error("The relay no longer knows this agent")]
  Evicted,
  #[error(transparent)]
  Outbound(#[from] OutboundError),
}

impl AgentError {
  /// Errors a reconnect cannot fix
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      AgentError::Unauthorized | AgentError::InvalidConfiguration(_) | AgentError::Outbound(_)
    )
  }
}

/// Parameters used to run a relay agent
#[derive(Clone)]
pub struct AgentConfig {
  /// `ws(s)://` socket URL in push mode, `http(s)://` base URL in pull mode
  pub server_url: Url,
  pub target_api: Url,
  pub api_key: Option<String>,
  pub transport_mode: TransportMode,
  pub reconnect_interval: Duration,
  pub outbound_timeout: Duration,
  pub heartbeat_interval: Duration,
  pub poll_wait: Duration,
  pub accept_invalid_target_certs: bool,
}

impl AgentConfig {
  pub fn new(server_url: Url, target_api: Url) -> Self {
    Self {
      server_url,
      target_api,
      api_key: None,
      transport_mode: TransportMode::Push,
      reconnect_interval: Duration::from_millis(5_000),
      outbound_timeout: Duration::from_millis(25_000),
      heartbeat_interval: Duration::from_millis(10_000),
      poll_wait: Duration::from_millis(25_000),
      accept_invalid_target_certs: false,
    }
  }

  fn validate(&self) -> Result<(), AgentError> {
    let expected: &[&str] = match self.transport_mode {
      TransportMode::Push => &["ws", "wss"],
      TransportMode::Pull => &["http", "https"],
    };
    if !expected.contains(&self.server_url.scheme()) {
      return Err(AgentError::InvalidConfiguration(format!(
        "{} mode needs a {} server URL, got {:?}",
        self.transport_mode,
        expected.join("/"),
        self.server_url.as_str()
      )));
    }
    Ok(())
  }
}

impl std::fmt::Debug for AgentConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AgentConfig")
      .field("server_url", &self.server_url.as_str())
      .field("target_api", &self.target_api.as_str())
      .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
      .field("transport_mode", &self.transport_mode)
      .field("reconnect_interval", &self.reconnect_interval)
      .field("outbound_timeout", &self.outbound_timeout)
      .field("heartbeat_interval", &self.heartbeat_interval)
      .field("poll_wait", &self.poll_wait)
      .field("accept_invalid_target_certs", &self.accept_invalid_target_certs)
      .finish()
  }
}

/// Replays one descriptor against the target; failures become a synthetic 500
pub async fn dispatch(outbound: &dyn OutboundHttp, descriptor: &RequestDescriptor) -> ResponseDescriptor {
  match outbound.call(descriptor).await {
    Ok(response) => {
      tracing::info!(
        request = %descriptor.request_id,
        method = %descriptor.method,
        path = %descriptor.path,
        status = response.status_code,
        "Forwarded request"
      );
      response
    }
    Err(error) => {
      tracing::warn!(
        request = %descriptor.request_id,
        method = %descriptor.method,
        path = %descriptor.path,
        %error,
        "Failed to forward request to target"
      );
      ResponseDescriptor::synthetic_failure(
        descriptor.request_id.clone(),
        500,
        "Internal Server Error",
        &error.to_string(),
      )
    }
  }
}

pub struct RelayAgent {
  config: AgentConfig,
  outbound: Arc<dyn OutboundHttp>,
  relay_http: reqwest::Client,
}

impl RelayAgent {
  pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
    let outbound = ReqwestOutbound::new(
      config.target_api.clone(),
      config.outbound_timeout,
      config.accept_invalid_target_certs,
    )?;
    Self::with_outbound(config, Arc::new(outbound))
  }

  pub fn with_outbound(config: AgentConfig, outbound: Arc<dyn OutboundHttp>) -> Result<Self, AgentError> {
    config.validate()?;
    let relay_http = reqwest::Client::builder()
      .build()
      .map_err(|error| AgentError::InvalidConfiguration(error.to_string()))?;
    Ok(Self {
      config,
      outbound,
      relay_http,
    })
  }

  pub fn config(&self) -> &AgentConfig {
    &self.config
  }

  /// Runs sessions back to back until shutdown or a fatal error.
  ///
  /// Only this loop starts sessions, so reconnect attempts never overlap.
  #[tracing::instrument(skip(self, shutdown), fields(mode = %self.config.transport_mode, server = %self.config.server_url), err)]
  pub async fn run(&self, shutdown: CancellationListener) -> Result<(), AgentError> {
    tracing::info!(target_api = %self.config.target_api, "Starting relay agent");
    loop {
      if shutdown.is_cancelled() {
        return Ok(());
      }
      let result = match self.config.transport_mode {
        TransportMode::Push => push::run_session(self, &shutdown).await,
        TransportMode::Pull => pull::run_session(self, &shutdown).await,
      };
      match result {
        Ok(()) if shutdown.is_cancelled() => return Ok(()),
        Ok(()) => tracing::warn!("Relay session ended"),
        Err(AgentError::Unauthorized) => {
          tracing::warn!("Check that the agent's API key matches the API_KEY configured on the relay server");
          return Err(AgentError::Unauthorized);
        }
        Err(error) if error.is_fatal() => return Err(error),
        Err(error) => tracing::warn!(%error, "Disconnected from relay"),
      }
      tracing::info!(
        delay_ms = self.config.reconnect_interval.as_millis() as u64,
        "Reconnecting after delay"
      );
      if !shutdown.sleep(self.config.reconnect_interval).await {
        return Ok(());
      }
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use std::{
    sync::{
      atomic::{AtomicUsize, Ordering},
      Arc,
    },
    time::Duration,
  };

  use futures::future::{BoxFuture, FutureExt};
  use url::Url;

  use super::{dispatch, AgentConfig, AgentError, OutboundError, OutboundHttp, RelayAgent};
  use crate::common::protocol::{
    descriptor::{RequestDescriptor, ResponseDescriptor},
    transport::TransportMode,
    RequestId,
  };

  /// Echoes the request body back, or fails every call
  #[derive(Default)]
  pub(crate) struct StubOutbound {
    pub(crate) fail: bool,
    pub(crate) calls: AtomicUsize,
  }

  impl OutboundHttp for StubOutbound {
    fn call<'a>(
      &'a self,
      descriptor: &'a RequestDescriptor,
    ) -> BoxFuture<'a, Result<ResponseDescriptor, OutboundError>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let result = if self.fail {
        Err(OutboundError::Timeout)
      } else {
        Ok(ResponseDescriptor {
          body_encoding: descriptor.body_encoding,
          ..ResponseDescriptor::new(descriptor.request_id.clone(), 200, descriptor.body.clone())
        })
      };
      futures::future::ready(result).boxed()
    }
  }

  fn descriptor() -> RequestDescriptor {
    serde_json::from_value(serde_json::json!({
      "requestId": "r1",
      "method": "GET",
      "path": "/users/1",
      "body": "hello",
    }))
    .unwrap()
  }

  #[tokio::test]
  async fn dispatch_passes_responses_through() {
    let outbound = StubOutbound::default();
    let response = dispatch(&outbound, &descriptor()).await;
    assert_eq!(response.request_id, RequestId::new("r1"));
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, "hello");
  }

  #[tokio::test]
  async fn dispatch_turns_failures_into_server_errors() {
    let outbound = StubOutbound {
      fail: true,
      ..Default::default()
    };
    let response = dispatch(&outbound, &descriptor()).await;
    assert_eq!(response.status_code, 500);
    assert_eq!(response.body["error"], "Internal Server Error");
    assert_eq!(response.body["message"], "Request to target timed out");
  }

  #[test]
  fn server_url_must_match_the_mode() {
    let mut config = AgentConfig::new(
      Url::parse("http://relay.example").unwrap(),
      Url::parse("http://localhost:8088").unwrap(),
    );
    let outbound = Arc::new(StubOutbound::default());
    assert!(matches!(
      RelayAgent::with_outbound(config.clone(), outbound.clone()),
      Err(AgentError::InvalidConfiguration(_))
    ));
    config.transport_mode = TransportMode::Pull;
    assert!(RelayAgent::with_outbound(config, outbound).is_ok());
  }

  #[tokio::test(start_paused = true)]
  async fn run_retries_until_shutdown() {
    // Nothing listens on this port, so every session fails to connect
    let mut config = AgentConfig::new(
      Url::parse("http://127.0.0.1:9").unwrap(),
      Url::parse("http://localhost:8088").unwrap(),
    );
    config.transport_mode = TransportMode::Pull;
    config.reconnect_interval = Duration::from_secs(5);
    let agent = RelayAgent::with_outbound(config, Arc::new(StubOutbound::default())).unwrap();
    let shutdown = tokio_util::sync::CancellationToken::new();
    let stopper = {
      let shutdown = shutdown.clone();
      tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(12)).await;
        shutdown.cancel();
      })
    };
    assert!(agent.run(shutdown.clone().into()).await.is_ok());
    stopper.await.unwrap();
  }
}
