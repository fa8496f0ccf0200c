// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{net::SocketAddr, sync::Arc};

use axum::{
  body::Body,
  extract::{ConnectInfo, State},
  http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
  response::{IntoResponse, Response},
  Json,
};
use bytes::Bytes;
use serde::Serialize;

use super::{error::ApiError, AppState};
use crate::common::protocol::{
  descriptor::{encode_body, header_fields, header_map, ForwardedRequest, MessageBody},
  tunnel::id::ConnectionId,
  ResponseDescriptor,
};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Health {
  status: &'static str,
  connected_clients: usize,
  message: &'static str,
}

pub(super) async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
  let connected_clients = state.daemon.registry().len();
  Json(Health {
    status: "ok",
    connected_clients,
    message: if connected_clients > 0 {
      "Ready to proxy requests"
    } else {
      "Waiting for remote clients to connect"
    },
  })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ClientSummary {
  id: ConnectionId,
  pending_requests: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ClientList {
  connected_clients: Vec<ClientSummary>,
}

pub(super) async fn clients(State(state): State<Arc<AppState>>) -> Json<ClientList> {
  let connected_clients = state
    .daemon
    .registry()
    .snapshot()
    .iter()
    .map(|connection| ClientSummary {
      id: connection.id(),
      pending_requests: connection.pending_count(),
    })
    .collect();
  Json(ClientList { connected_clients })
}

/// Splits `/api/<id>/<rest>?<query>` into the raw id and the peer-relative path with its query
fn split_proxy_uri(uri: &Uri) -> (&str, String) {
  let mut segments = uri.path().splitn(4, '/').skip(2);
  let raw_id = segments.next().unwrap_or("");
  let mut path = format!("/{}", segments.next().unwrap_or(""));
  if let Some(query) = uri.query() {
    path.push('?');
    path.push_str(query);
  }
  (raw_id, path)
}

pub(super) async fn forward(
  State(state): State<Arc<AppState>>,
  connect_info: Option<ConnectInfo<SocketAddr>>,
  method: Method,
  uri: Uri,
  headers: HeaderMap,
  body: Bytes,
) -> Result<Response, ApiError> {
  let client = connect_info.map(|ConnectInfo(addr)| addr.ip());
  state.rate_limiter.check(client)?;
  state.authenticate(&headers)?;

  let (raw_id, path) = split_proxy_uri(&uri);
  let connection_id = raw_id
    .parse::<ConnectionId>()
    .map_err(|_| ApiError::UnknownConnection(raw_id.to_owned()))?;

  let content_type = headers
    .get(header::CONTENT_TYPE)
    .and_then(|value| value.to_str().ok());
  let mut request = ForwardedRequest::new(method.as_str(), path)
    .with_raw_body(content_type, &body)
    .with_headers(header_fields(&headers));
  request.query = uri
    .query()
    .map(|query| {
      url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
    })
    .unwrap_or_default();

  tracing::debug!(connection = %connection_id, method = %request.method, path = %request.path, "Forwarding request");
  let response = state.daemon.forward(connection_id, request).await?;
  Ok(into_http_response(response))
}

/// Writes a peer's response back to the public caller
pub(super) fn into_http_response(response: ResponseDescriptor) -> Response {
  let status = StatusCode::from_u16(response.status_code).unwrap_or_else(|_| {
    tracing::warn!(
      status = response.status_code,
      "Remote client returned an invalid status code"
    );
    StatusCode::BAD_GATEWAY
  });
  let mut headers = header_map(&response.headers);
  let structured = matches!(
    response.body,
    MessageBody::Object(_) | MessageBody::Array(_) | MessageBody::Number(_) | MessageBody::Bool(_)
  );
  if structured && !headers.contains_key(header::CONTENT_TYPE) {
    headers.insert(
      header::CONTENT_TYPE,
      HeaderValue::from_static("application/json"),
    );
  }
  let body = encode_body(&response.body, response.body_encoding);
  (status, headers, Body::from(body)).into_response()
}
