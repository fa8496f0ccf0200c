// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use axum::{
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};

use crate::common::{daemon::ForwardError, protocol::descriptor::ExchangeFailure};

/// Failures surfaced to public callers and agents as `{error, message}` envelopes
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
  #[error("Valid API Key required")]
  Unauthorized,
  #[error("The specified remote client is not connected to the server")]
  UnknownConnection(String),
  #[error("Remote client did not respond in time")]
  Timeout,
  #[error("The remote client was disconnected")]
  Gone,
  #[error("Remote client disconnected before responding")]
  ConnectionLost,
  #[error("Failed to forward request to remote client")]
  Undeliverable,
  #[error("Too many requests, retry after {retry_after_secs}s")]
  RateLimited { retry_after_secs: u64 },
  #[error("{0}")]
  BadRequest(String),
}

impl ApiError {
  pub fn status(&self) -> StatusCode {
    match self {
      ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
      ApiError::UnknownConnection(_) => StatusCode::NOT_FOUND,
      ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
      ApiError::Gone => StatusCode::GONE,
      ApiError::ConnectionLost => StatusCode::BAD_GATEWAY,
      ApiError::Undeliverable => StatusCode::INTERNAL_SERVER_ERROR,
      ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
      ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
    }
  }

  /// Short label carried in the envelope's `error` field
  pub fn title(&self) -> &'static str {
    match self {
      ApiError::Unauthorized => "Unauthorized",
      ApiError::UnknownConnection(_) => "Remote client not connected",
      ApiError::Timeout => "Gateway Timeout",
      ApiError::Gone => "Gone",
      ApiError::ConnectionLost => "Bad Gateway",
      ApiError::Undeliverable => "Internal Server Error",
      ApiError::RateLimited { .. } => "Too Many Requests",
      ApiError::BadRequest(_) => "Bad Request",
    }
  }
}

impl From<ForwardError> for ApiError {
  fn from(error: ForwardError) -> Self {
    match error {
      ForwardError::NotConnected(id) => ApiError::UnknownConnection(id.to_string()),
      ForwardError::Exchange(ExchangeFailure::TimedOut) => ApiError::Timeout,
      ForwardError::Exchange(ExchangeFailure::ConnectionLost(_)) => ApiError::ConnectionLost,
      ForwardError::Exchange(ExchangeFailure::Undeliverable) => ApiError::Undeliverable,
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let body = serde_json::json!({
      "error": self.title(),
      "message": self.to_string(),
    });
    let mut response = (self.status(), Json(body)).into_response();
    if let ApiError::RateLimited { retry_after_secs } = self {
      response
        .headers_mut()
        .insert(axum::http::header::RETRY_AFTER, retry_after_secs.into());
    }
    response
  }
}
