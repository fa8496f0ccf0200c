// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use axum::http::{header::AUTHORIZATION, HeaderMap};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
  #[error("No API key was presented")]
  MissingCredential,
  #[error("The presented API key is invalid")]
  InvalidCredential,
}

pub trait AuthenticationHandler: std::fmt::Debug + Send + Sync {
  /// Checks the credential a caller presented, if any
  fn authenticate(&self, presented: Option<&str>) -> Result<(), AuthenticationError>;

  /// Whether every caller is admitted without a credential
  fn is_open(&self) -> bool {
    false
  }
}

/// Reads the credential from `Authorization: Bearer <key>`, falling back to `X-API-Key`
pub fn presented_credential(headers: &HeaderMap) -> Option<&str> {
  let bearer = headers
    .get(AUTHORIZATION)
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.strip_prefix("Bearer "))
    .map(str::trim);
  bearer.or_else(|| {
    headers
      .get(API_KEY_HEADER)
      .and_then(|value| value.to_str().ok())
      .map(str::trim)
  })
}
