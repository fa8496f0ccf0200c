// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use subtle::ConstantTimeEq;

use super::traits::*;

/// Admits callers presenting one shared key
pub struct ApiKeyAuthenticationHandler {
  expected: Vec<u8>,
}

impl ApiKeyAuthenticationHandler {
  pub fn new(api_key: impl Into<String>) -> ApiKeyAuthenticationHandler {
    ApiKeyAuthenticationHandler {
      expected: api_key.into().into_bytes(),
    }
  }

  fn matches(&self, presented: &str) -> bool {
    let presented = presented.as_bytes();
    // Compare padded buffers so timing does not leak the matching prefix length
    let len = self.expected.len().max(presented.len());
    let mut expected_padded = vec![0u8; len];
    let mut presented_padded = vec![0xFFu8; len];
    expected_padded[..self.expected.len()].copy_from_slice(&self.expected);
    presented_padded[..presented.len()].copy_from_slice(presented);
    let lengths_equal = self.expected.len().ct_eq(&presented.len());
    (lengths_equal & expected_padded.ct_eq(&presented_padded)).into()
  }
}

impl std::fmt::Debug for ApiKeyAuthenticationHandler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "({})",
      std::any::type_name::<ApiKeyAuthenticationHandler>()
    )
  }
}

impl AuthenticationHandler for ApiKeyAuthenticationHandler {
  fn authenticate(&self, presented: Option<&str>) -> Result<(), AuthenticationError> {
    match presented {
      None => Err(AuthenticationError::MissingCredential),
      Some(key) if self.matches(key) => Ok(()),
      Some(_) => Err(AuthenticationError::InvalidCredential),
    }
  }
}
