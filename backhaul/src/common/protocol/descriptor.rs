// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Transport-agnostic descriptions of one forwarded HTTP exchange.
//!
//! These structures double as the wire envelopes for both transports; field
//! names are camelCase on the wire.
use std::collections::BTreeMap;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::tunnel::{id::RequestId, TunnelCloseReason};

/// Header mapping carried by descriptors; repeated headers are joined with `", "`.
pub type HeaderFields = BTreeMap<String, String>;

/// Body of a forwarded message.
///
/// JSON payloads travel structured, other text travels as a JSON string, and an
/// absent body is `null`. Bytes that are not UTF-8 travel as a base64 string,
/// flagged by [`BodyEncoding::Base64`] on the envelope.
pub type MessageBody = serde_json::Value;

/// Encoding applied to a string body so that arbitrary bytes survive JSON
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
  Base64,
}

/// Headers which describe the hop rather than the message, and must not cross the relay
pub const TRANSPORT_UNSAFE_HEADERS: &[&str] = &[
  "host",
  "content-length",
  "connection",
  "keep-alive",
  "proxy-connection",
  "transfer-encoding",
  "upgrade",
];

pub fn is_transport_unsafe(name: &str) -> bool {
  TRANSPORT_UNSAFE_HEADERS
    .iter()
    .any(|unsafe_name| name.eq_ignore_ascii_case(unsafe_name))
}

/// Flattens an HTTP header map, dropping transport-unsafe headers
pub fn header_fields(headers: &HeaderMap) -> HeaderFields {
  let mut fields = HeaderFields::new();
  for (name, value) in headers.iter() {
    if is_transport_unsafe(name.as_str()) {
      continue;
    }
    let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
    fields
      .entry(name.as_str().to_owned())
      .and_modify(|existing: &mut String| {
        existing.push_str(", ");
        existing.push_str(&value);
      })
      .or_insert(value);
  }
  fields
}

/// Rebuilds an HTTP header map, skipping transport-unsafe and unrepresentable entries
pub fn header_map(fields: &HeaderFields) -> HeaderMap {
  let mut headers = HeaderMap::with_capacity(fields.len());
  for (name, value) in fields.iter() {
    if is_transport_unsafe(name) {
      continue;
    }
    match (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      (Ok(name), Ok(value)) => {
        headers.append(name, value);
      }
      _ => tracing::debug!(header = %name, "Dropping header that is not valid HTTP"),
    }
  }
  headers
}

fn is_json_content_type(content_type: Option<&str>) -> bool {
  content_type
    .map(|ct| {
      let essence = ct.split(';').next().unwrap_or("").trim();
      essence.eq_ignore_ascii_case("application/json") || essence.ends_with("+json")
    })
    .unwrap_or(false)
}

/// Interprets a buffered HTTP body according to its content type
pub fn decode_body(content_type: Option<&str>, raw: &[u8]) -> (MessageBody, Option<BodyEncoding>) {
  if raw.is_empty() {
    return (MessageBody::Null, None);
  }
  if is_json_content_type(content_type) {
    if let Ok(value) = serde_json::from_slice(raw) {
      return (value, None);
    }
  }
  match std::str::from_utf8(raw) {
    Ok(text) => (MessageBody::String(text.to_owned()), None),
    Err(_) => (
      MessageBody::String(STANDARD.encode(raw)),
      Some(BodyEncoding::Base64),
    ),
  }
}

/// Serializes a body back to bytes; strings are written raw, structured values as JSON
pub fn encode_body(body: &MessageBody, encoding: Option<BodyEncoding>) -> Bytes {
  if let Some(BodyEncoding::Base64) = encoding {
    match body.as_str().map(|encoded| STANDARD.decode(encoded)) {
      Some(Ok(raw)) => return Bytes::from(raw),
      Some(Err(error)) => {
        tracing::warn!(%error, "Body marked as base64 does not decode; sending it as text")
      }
      None => tracing::warn!("Ignoring base64 encoding on a body that is not a string"),
    }
  }
  match body {
    MessageBody::Null => Bytes::new(),
    MessageBody::String(text) => Bytes::copy_from_slice(text.as_bytes()),
    structured => serde_json::to_vec(structured)
      .map(Bytes::from)
      .unwrap_or_default(),
  }
}

/// A public request as received, before the correlator assigns it an id
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardedRequest {
  pub method: String,
  /// Path relative to the peer's target, including the query string
  pub path: String,
  pub headers: HeaderFields,
  pub body: MessageBody,
  pub body_encoding: Option<BodyEncoding>,
  pub query: BTreeMap<String, String>,
}

impl ForwardedRequest {
  pub fn new<M: Into<String>, P: Into<String>>(method: M, path: P) -> Self {
    Self {
      method: method.into(),
      path: path.into(),
      headers: HeaderFields::new(),
      body: MessageBody::Null,
      body_encoding: None,
      query: BTreeMap::new(),
    }
  }

  pub fn with_body(mut self, body: MessageBody) -> Self {
    self.body = body;
    self.body_encoding = None;
    self
  }

  /// Takes the body as received from the wire
  pub fn with_raw_body(mut self, content_type: Option<&str>, raw: &[u8]) -> Self {
    let (body, body_encoding) = decode_body(content_type, raw);
    self.body = body;
    self.body_encoding = body_encoding;
    self
  }

  pub fn with_headers(mut self, headers: HeaderFields) -> Self {
    self.headers = headers;
    self
  }

  pub fn into_descriptor(self, request_id: RequestId) -> RequestDescriptor {
    let mut headers = self.headers;
    headers.retain(|name, _| !is_transport_unsafe(name));
    RequestDescriptor {
      request_id,
      method: self.method,
      path: self.path,
      headers,
      body: self.body,
      body_encoding: self.body_encoding,
      query: self.query,
    }
  }
}

/// Server → peer envelope
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDescriptor {
  pub request_id: RequestId,
  pub method: String,
  pub path: String,
  #[serde(default)]
  pub headers: HeaderFields,
  #[serde(default)]
  pub body: MessageBody,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body_encoding: Option<BodyEncoding>,
  #[serde(default)]
  pub query: BTreeMap<String, String>,
}

fn default_status_code() -> u16 {
  200
}

/// Peer → server envelope
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDescriptor {
  pub request_id: RequestId,
  #[serde(default = "default_status_code")]
  pub status_code: u16,
  #[serde(default)]
  pub headers: HeaderFields,
  #[serde(default)]
  pub body: MessageBody,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body_encoding: Option<BodyEncoding>,
}

impl ResponseDescriptor {
  pub fn new(request_id: RequestId, status_code: u16, body: MessageBody) -> Self {
    Self {
      request_id,
      status_code,
      headers: HeaderFields::new(),
      body,
      body_encoding: None,
    }
  }

  /// Standard `{error, message}` envelope for failures produced in place of a real response
  pub fn synthetic_failure(request_id: RequestId, status_code: u16, error: &str, message: &str) -> Self {
    let mut response = Self::new(
      request_id,
      status_code,
      serde_json::json!({ "error": error, "message": message }),
    );
    response.headers.insert(
      header::CONTENT_TYPE.as_str().to_owned(),
      "application/json".to_owned(),
    );
    response
  }
}

/// Why an exchange ended without a response from its peer
#[derive(thiserror::Error, Debug, Clone)]
pub enum ExchangeFailure {
  #[error("Remote client did not respond in time")]
  TimedOut,
  #[error("Remote client disconnected before responding: {0}")]
  ConnectionLost(TunnelCloseReason),
  #[error("Request could not be delivered to the remote client")]
  Undeliverable,
}

pub type ExchangeOutcome = Result<ResponseDescriptor, ExchangeFailure>;

/// The public side of an exchange; completed exactly once per opened request
pub trait ResponseSink: Send + 'static {
  fn complete(self: Box<Self>, outcome: ExchangeOutcome);
}

impl ResponseSink for tokio::sync::oneshot::Sender<ExchangeOutcome> {
  fn complete(self: Box<Self>, outcome: ExchangeOutcome) {
    // The caller may have hung up; nobody is left to tell
    let _ = (*self).send(outcome);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn header_fields_strip_transport_headers() {
    let mut headers = HeaderMap::new();
    headers.insert(header::HOST, HeaderValue::from_static("relay.example"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
    headers.insert("x-api-key", HeaderValue::from_static("secret"));
    headers.append(header::ACCEPT, HeaderValue::from_static("text/html"));
    headers.append(header::ACCEPT, HeaderValue::from_static("application/json"));

    let fields = header_fields(&headers);
    assert!(!fields.contains_key("host"));
    assert!(!fields.contains_key("content-length"));
    assert_eq!(fields.get("x-api-key").map(String::as_str), Some("secret"));
    assert_eq!(
      fields.get("accept").map(String::as_str),
      Some("text/html, application/json")
    );
  }

  #[test]
  fn bodies_keep_their_shape() {
    let (json, encoding) = decode_body(Some("application/json; charset=utf-8"), br#"{"a":1}"#);
    assert_eq!(json, serde_json::json!({"a": 1}));
    assert_eq!(encoding, None);
    assert_eq!(encode_body(&json, encoding).as_ref(), br#"{"a":1}"#);

    let (text, encoding) = decode_body(Some("text/plain"), b"{\"a\":1}");
    assert_eq!(text, MessageBody::String("{\"a\":1}".into()));
    assert_eq!(encode_body(&text, encoding).as_ref(), b"{\"a\":1}");

    assert_eq!(decode_body(None, b""), (MessageBody::Null, None));
    assert!(encode_body(&MessageBody::Null, None).is_empty());
  }

  #[test]
  fn binary_bodies_survive_the_envelope() {
    let raw = [0x89, b'P', b'N', b'G', 0xff, 0x00, 0xfe];
    let (body, encoding) = decode_body(Some("image/png"), &raw);
    assert_eq!(encoding, Some(BodyEncoding::Base64));

    let mut response = ResponseDescriptor::new(RequestId::new("r1"), 200, body);
    response.body_encoding = encoding;
    let wire = serde_json::to_value(&response).unwrap();
    assert_eq!(wire["bodyEncoding"], "base64");
    let received: ResponseDescriptor = serde_json::from_value(wire).unwrap();
    assert_eq!(
      encode_body(&received.body, received.body_encoding).as_ref(),
      &raw[..]
    );

    // Text bodies carry no encoding flag on the wire
    let plain = ResponseDescriptor::new(RequestId::new("r2"), 200, MessageBody::String("hi".into()));
    assert!(serde_json::to_value(&plain).unwrap().get("bodyEncoding").is_none());
  }

  #[test]
  fn undecodable_base64_is_sent_as_text() {
    let body = MessageBody::String("not base64!".into());
    assert_eq!(
      encode_body(&body, Some(BodyEncoding::Base64)).as_ref(),
      b"not base64!"
    );
  }

  #[test]
  fn response_status_defaults_to_ok() {
    let response: ResponseDescriptor =
      serde_json::from_str(r#"{"requestId":"r1","body":"hi"}"#).unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(response.request_id, RequestId::new("r1"));
  }

  #[test]
  fn descriptor_drops_unsafe_headers() {
    let mut headers = HeaderFields::new();
    headers.insert("Host".into(), "public.example".into());
    headers.insert("x-trace".into(), "1".into());
    let descriptor = ForwardedRequest::new("GET", "/users/1")
      .with_headers(headers)
      .into_descriptor(RequestId::new("r1"));
    assert_eq!(descriptor.headers.len(), 1);
    let wire = serde_json::to_value(&descriptor).unwrap();
    assert_eq!(wire["requestId"], "r1");
    assert_eq!(wire["path"], "/users/1");
  }
}
