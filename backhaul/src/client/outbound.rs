// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Issuing forwarded requests against the private target.

use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use futures::future::{BoxFuture, FutureExt};
use url::Url;

use crate::common::protocol::descriptor::{
  decode_body, encode_body, header_fields, header_map, MessageBody, RequestDescriptor,
  ResponseDescriptor,
};

#[derive(thiserror::Error, Debug)]
pub enum OutboundError {
  #[error("Invalid target URL {url:?}: {reason}")]
  InvalidUrl { url: String, reason: String },
  #[error("Invalid HTTP method {0:?}")]
  InvalidMethod(String),
  #[error("Request to target timed out")]
  Timeout,
  #[error("Request to target failed: {0}")]
  Request(#[from] reqwest::Error),
}

/// Produces a response for a delivered descriptor; any HTTP status counts as success
pub trait OutboundHttp: Send + Sync + 'static {
  fn call<'a>(
    &'a self,
    descriptor: &'a RequestDescriptor,
  ) -> BoxFuture<'a, Result<ResponseDescriptor, OutboundError>>;
}

pub struct ReqwestOutbound {
  client: reqwest::Client,
  target: Url,
}

impl ReqwestOutbound {
  pub fn new(
    target: Url,
    timeout: Duration,
    accept_invalid_certs: bool,
  ) -> Result<Self, OutboundError> {
    if accept_invalid_certs {
      tracing::warn!(%target, "TLS certificate validation is disabled for the target");
    }
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .danger_accept_invalid_certs(accept_invalid_certs)
      .build()?;
    Ok(Self { client, target })
  }

  /// The descriptor's path already carries its query, so it is appended verbatim
  fn url_for(&self, path: &str) -> Result<Url, OutboundError> {
    let base = self.target.as_str().trim_end_matches('/');
    let joined = if path.starts_with('/') {
      format!("{}{}", base, path)
    } else {
      format!("{}/{}", base, path)
    };
    Url::parse(&joined).map_err(|error| OutboundError::InvalidUrl {
      url: joined,
      reason: error.to_string(),
    })
  }

  async fn send(&self, descriptor: &RequestDescriptor) -> Result<ResponseDescriptor, OutboundError> {
    let url = self.url_for(&descriptor.path)?;
    let method = Method::from_bytes(descriptor.method.as_bytes())
      .map_err(|_| OutboundError::InvalidMethod(descriptor.method.clone()))?;

    let mut headers = header_map(&descriptor.headers);
    let structured = !matches!(descriptor.body, MessageBody::Null | MessageBody::String(_));
    if structured && !headers.contains_key(header::CONTENT_TYPE) {
      headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
      );
    }

    tracing::debug!(request = %descriptor.request_id, %method, %url, "Forwarding to target");
    let response = self
      .client
      .request(method, url)
      .headers(headers)
      .body(encode_body(&descriptor.body, descriptor.body_encoding))
      .send()
      .await
      .map_err(classify)?;

    let status_code = response.status().as_u16();
    let headers = header_fields(response.headers());
    let raw = response.bytes().await.map_err(classify)?;
    let content_type = headers.get(header::CONTENT_TYPE.as_str()).map(String::as_str);
    let (body, body_encoding) = decode_body(content_type, &raw);
    Ok(ResponseDescriptor {
      request_id: descriptor.request_id.clone(),
      status_code,
      headers,
      body,
      body_encoding,
    })
  }
}

fn classify(error: reqwest::Error) -> OutboundError {
  if error.is_timeout() {
    OutboundError::Timeout
  } else {
    OutboundError::Request(error)
  }
}

impl OutboundHttp for ReqwestOutbound {
  fn call<'a>(
    &'a self,
    descriptor: &'a RequestDescriptor,
  ) -> BoxFuture<'a, Result<ResponseDescriptor, OutboundError>> {
    self.send(descriptor).boxed()
  }
}

impl std::fmt::Debug for ReqwestOutbound {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ReqwestOutbound")
      .field("target", &self.target.as_str())
      .finish_non_exhaustive()
  }
}
