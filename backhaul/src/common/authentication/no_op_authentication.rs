// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use super::traits::*;

/// Open mode: every caller is admitted
#[derive(Default)]
pub struct NoOpAuthenticationHandler {}

impl NoOpAuthenticationHandler {
  pub fn new() -> NoOpAuthenticationHandler {
    NoOpAuthenticationHandler {}
  }
}

impl std::fmt::Debug for NoOpAuthenticationHandler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "({})",
      std::any::type_name::<NoOpAuthenticationHandler>()
    )
  }
}

impl AuthenticationHandler for NoOpAuthenticationHandler {
  fn authenticate(&self, presented: Option<&str>) -> Result<(), AuthenticationError> {
    tracing::debug!(
      credential_presented = presented.is_some(),
      "Admitting caller without authentication"
    );
    Ok(())
  }

  fn is_open(&self) -> bool {
    true
  }
}
