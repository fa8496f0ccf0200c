// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{sync::Arc, time::Duration};

use axum::{
  extract::{Path, Query, State},
  http::{HeaderMap, StatusCode},
  response::{IntoResponse, Response},
  Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{error::ApiError, AppState};
use crate::common::protocol::{
  transport::{PollOutcome, PullTransport},
  tunnel::{id::ConnectionId, Connection},
  ResponseDescriptor,
};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Registration {
  connection_id: ConnectionId,
  /// Longest wait the relay grants a single poll
  poll_timeout_ms: u64,
  /// Silence after which the relay evicts the agent
  liveness_timeout_ms: u64,
}

#[derive(Deserialize)]
pub(super) struct PollParams {
  /// Requested wait in milliseconds; capped by the relay's poll timeout
  wait: Option<u64>,
}

fn pull_transport(state: &AppState) -> Result<&Arc<PullTransport>, ApiError> {
  state
    .daemon
    .transport()
    .as_pull()
    .ok_or_else(|| ApiError::BadRequest("The relay is not running in pull mode".to_owned()))
}

fn connection(state: &AppState, raw_id: &str) -> Result<Arc<Connection>, ApiError> {
  raw_id
    .parse::<ConnectionId>()
    .ok()
    .and_then(|id| state.daemon.registry().get(id))
    .ok_or_else(|| ApiError::UnknownConnection(raw_id.to_owned()))
}

pub(super) async fn register(
  State(state): State<Arc<AppState>>,
  headers: HeaderMap,
) -> Result<Response, ApiError> {
  state.authenticate(&headers)?;
  let connection = state.daemon.register_pull();
  let registration = Registration {
    connection_id: connection.id(),
    poll_timeout_ms: state.config.poll_timeout.as_millis() as u64,
    liveness_timeout_ms: (state.config.ping_interval * 2).as_millis() as u64,
  };
  Ok((StatusCode::CREATED, Json(registration)).into_response())
}

pub(super) async fn heartbeat(
  State(state): State<Arc<AppState>>,
  Path(raw_id): Path<String>,
  headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
  state.authenticate(&headers)?;
  let connection = connection(&state, &raw_id)?;
  connection.touch();
  tracing::trace!(connection = %connection.id(), "Heartbeat");
  Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn poll(
  State(state): State<Arc<AppState>>,
  Path(raw_id): Path<String>,
  Query(params): Query<PollParams>,
  headers: HeaderMap,
) -> Result<Response, ApiError> {
  state.authenticate(&headers)?;
  let transport = pull_transport(&state)?;
  let connection = connection(&state, &raw_id)?;
  let wait = params
    .wait
    .map(Duration::from_millis)
    .map_or(state.config.poll_timeout, |wait| wait.min(state.config.poll_timeout));

  match transport.poll(&connection, wait).await {
    PollOutcome::Delivered(descriptor) => Ok(Json(descriptor).into_response()),
    PollOutcome::Empty => Ok(StatusCode::NO_CONTENT.into_response()),
    PollOutcome::Gone => Err(ApiError::Gone),
  }
}

pub(super) async fn post_response(
  State(state): State<Arc<AppState>>,
  Path(raw_id): Path<String>,
  headers: HeaderMap,
  body: Bytes,
) -> Result<StatusCode, ApiError> {
  state.authenticate(&headers)?;
  let transport = pull_transport(&state)?;
  let connection = connection(&state, &raw_id)?;
  let response: ResponseDescriptor = serde_json::from_slice(&body)
    .map_err(|error| ApiError::BadRequest(format!("Malformed response envelope: {}", error)))?;
  let resolution = transport.post_result(&connection, response);
  tracing::trace!(connection = %connection.id(), ?resolution, "Result posted");
  Ok(StatusCode::NO_CONTENT)
}
