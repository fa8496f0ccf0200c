// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Long-poll session: register, keep a heartbeat going, and poll for work.

use std::{sync::Arc, time::Duration};

use reqwest::StatusCode;
use serde::Deserialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{dispatch, AgentError, OutboundHttp, RelayAgent};
use crate::{
  common::{
    authentication::API_KEY_HEADER,
    protocol::{ConnectionId, RequestDescriptor, ResponseDescriptor},
  },
  util::cancellation::CancellationListener,
};

/// Extra time granted to a poll request beyond the wait it asks for
const POLL_GRACE: Duration = Duration::from_secs(10);

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Registration {
  connection_id: ConnectionId,
  poll_timeout_ms: u64,
}

/// Relay endpoints for one registered connection
#[derive(Clone)]
struct PullEndpoints {
  http: reqwest::Client,
  base: String,
  api_key: Option<String>,
}

impl PullEndpoints {
  fn url(&self, route: &str) -> String {
    format!("{}/{}", self.base, route)
  }

  fn request(&self, method: reqwest::Method, route: &str) -> reqwest::RequestBuilder {
    let builder = self.http.request(method, self.url(route));
    match &self.api_key {
      Some(key) => builder.header(API_KEY_HEADER, key),
      None => builder,
    }
  }

  async fn register(&self) -> Result<Registration, AgentError> {
    let response = self
      .request(reqwest::Method::POST, "register")
      .send()
      .await
      .map_err(|error| AgentError::Connect(error.to_string()))?;
    match response.status() {
      StatusCode::UNAUTHORIZED => Err(AgentError::Unauthorized),
      status if status.is_success() => response
        .json::<Registration>()
        .await
        .map_err(|error| AgentError::Connect(format!("Malformed registration: {}", error))),
      status => Err(AgentError::Connect(format!(
        "Registration rejected with status {}",
        status
      ))),
    }
  }

  async fn heartbeat(&self, id: ConnectionId) -> Result<(), AgentError> {
    let response = self
      .request(reqwest::Method::POST, &format!("heartbeat/{}", id))
      .send()
      .await
      .map_err(|error| AgentError::Transport(error.to_string()))?;
    route_status(response.status()).map(|_| ())
  }

  async fn poll(&self, id: ConnectionId, wait: Duration) -> Result<Option<RequestDescriptor>, AgentError> {
    let response = self
      .request(reqwest::Method::GET, &format!("poll/{}", id))
      .query(&[("wait", wait.as_millis() as u64)])
      .timeout(wait + POLL_GRACE)
      .send()
      .await
      .map_err(|error| AgentError::Transport(error.to_string()))?;
    match route_status(response.status())? {
      StatusCode::NO_CONTENT => Ok(None),
      _ => response
        .json::<RequestDescriptor>()
        .await
        .map(Some)
        .map_err(|error| AgentError::Transport(format!("Malformed request descriptor: {}", error))),
    }
  }

  async fn post_result(&self, id: ConnectionId, response: &ResponseDescriptor) -> Result<(), AgentError> {
    let reply = self
      .request(reqwest::Method::POST, &format!("response/{}", id))
      .json(response)
      .send()
      .await
      .map_err(|error| AgentError::Transport(error.to_string()))?;
    route_status(reply.status()).map(|_| ())
  }
}

/// Maps relay statuses on per-connection routes to session outcomes
fn route_status(status: StatusCode) -> Result<StatusCode, AgentError> {
  match status {
    StatusCode::UNAUTHORIZED => Err(AgentError::Unauthorized),
    StatusCode::NOT_FOUND | StatusCode::GONE => Err(AgentError::Evicted),
    status if status.is_success() => Ok(status),
    status => Err(AgentError::Transport(format!(
      "Relay answered with status {}",
      status
    ))),
  }
}

pub(super) async fn run_session(
  agent: &RelayAgent,
  shutdown: &CancellationListener,
) -> Result<(), AgentError> {
  let config = agent.config();
  let endpoints = PullEndpoints {
    http: agent.relay_http.clone(),
    base: config.server_url.as_str().trim_end_matches('/').to_owned(),
    api_key: config.api_key.clone(),
  };

  let registration = tokio::select! {
    _ = shutdown.cancelled() => return Ok(()),
    registration = endpoints.register() => registration?,
  };
  let connection_id = registration.connection_id;
  let wait = config
    .poll_wait
    .min(Duration::from_millis(registration.poll_timeout_ms));
  let span = tracing::info_span!("pull_session", connection = %connection_id);

  async move {
    tracing::info!(wait_ms = wait.as_millis() as u64, "Registered with relay");
    let session = shutdown.child_token();
    // Stops the heartbeat however the session ends
    let _stop_heartbeat = session.clone().drop_guard();
    let heartbeat = tokio::task::spawn(
      run_heartbeat(
        endpoints.clone(),
        connection_id,
        config.heartbeat_interval,
        session.clone(),
      )
      .in_current_span(),
    );

    let result = poll_loop(&endpoints, connection_id, wait, &agent.outbound, &session).await;
    session.cancel();
    if heartbeat.await.is_err() {
      tracing::error!("Heartbeat task panicked");
    }
    result
  }
  .instrument(span)
  .await
}

async fn run_heartbeat(
  endpoints: PullEndpoints,
  connection_id: ConnectionId,
  interval: Duration,
  session: CancellationToken,
) {
  let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  loop {
    tokio::select! {
      _ = session.cancelled() => break,
      _ = ticker.tick() => {}
    }
    match endpoints.heartbeat(connection_id).await {
      Ok(()) => tracing::trace!("Heartbeat acknowledged"),
      Err(AgentError::Evicted) | Err(AgentError::Unauthorized) => {
        tracing::warn!("Heartbeat rejected; ending session");
        session.cancel();
        break;
      }
      Err(error) => tracing::debug!(%error, "Heartbeat failed"),
    }
  }
}

async fn poll_loop(
  endpoints: &PullEndpoints,
  connection_id: ConnectionId,
  wait: Duration,
  outbound: &Arc<dyn OutboundHttp>,
  session: &CancellationToken,
) -> Result<(), AgentError> {
  let mut dispatches = JoinSet::new();
  let result = loop {
    let polled = tokio::select! {
      _ = session.cancelled() => break Ok(()),
      polled = endpoints.poll(connection_id, wait) => polled,
    };
    // Reap finished dispatches so the set does not grow without bound
    while dispatches.try_join_next().is_some() {}
    match polled {
      Ok(None) => continue,
      Ok(Some(descriptor)) => {
        let outbound = Arc::clone(outbound);
        let endpoints = endpoints.clone();
        dispatches.spawn(
          async move {
            let response = dispatch(outbound.as_ref(), &descriptor).await;
            if let Err(error) = endpoints.post_result(connection_id, &response).await {
              tracing::warn!(request = %response.request_id, %error, "Failed to post result");
            }
          }
          .in_current_span(),
        );
      }
      Err(error) => break Err(error),
    }
  };
  if session.is_cancelled() && result.is_ok() {
    dispatches.abort_all();
  } else {
    // Let in-flight results reach the relay before reconnecting
    while dispatches.join_next().await.is_some() {}
  }
  result
}
