// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Types supporting authentication of remote clients
mod traits;
pub use traits::*;

mod api_key_authentication;
pub use api_key_authentication::ApiKeyAuthenticationHandler;

mod no_op_authentication;
pub use no_op_authentication::NoOpAuthenticationHandler;

use std::sync::Arc;

/// Picks the handler for an optional configured key; no key means open mode
pub fn handler_for_key(api_key: Option<&str>) -> Arc<dyn AuthenticationHandler> {
  match api_key.filter(|key| !key.is_empty()) {
    Some(key) => Arc::new(ApiKeyAuthenticationHandler::new(key)),
    None => Arc::new(NoOpAuthenticationHandler::new()),
  }
}
