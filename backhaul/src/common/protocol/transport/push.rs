// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Duplex (WebSocket) transport.
//!
//! The relay writes each request descriptor to the peer's socket the moment it
//! is opened, and every text message coming back is treated as a response.

use std::sync::Arc;

use super::{DeliveryError, TransportAdapter, TransportMode};
use crate::common::protocol::{
  correlator::{Correlator, Resolution},
  descriptor::{RequestDescriptor, ResponseDescriptor},
  tunnel::{registry::ConnectionRegistry, Connection, DuplexEndpoint, TransportHandle, TunnelCloseReason},
};

/// Frames the relay writes to a peer's socket
#[derive(Debug, Clone, PartialEq)]
pub enum PushFrame {
  Request(RequestDescriptor),
  Ping,
  Close,
}

/// Frames read from a peer's socket, independent of the WebSocket library
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
  Text(String),
  Binary(Vec<u8>),
  /// The WebSocket layer already answers pings; only the activity matters here
  Ping,
  Pong,
  Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
  Continue,
  Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushSessionState {
  /// Upgrade accepted, peer not yet admitted
  Connecting,
  /// Credential verified and connection registered
  Open,
  /// Socket is being torn down
  Closing,
  Closed,
}

#[derive(Debug, Default)]
pub struct PushTransport;

impl PushTransport {
  pub fn new() -> Self {
    Self
  }

  /// Applies one inbound frame to an open connection
  pub fn handle_inbound(&self, connection: &Connection, frame: InboundFrame) -> SessionControl {
    match frame {
      InboundFrame::Text(text) => {
        connection.touch();
        self.handle_response_text(connection, &text);
        SessionControl::Continue
      }
      InboundFrame::Binary(data) => {
        connection.touch();
        match String::from_utf8(data) {
          Ok(text) => {
            self.handle_response_text(connection, &text);
          }
          Err(_) => tracing::warn!(
            connection = %connection.id(),
            "Dropping non-UTF-8 binary message from remote client"
          ),
        }
        SessionControl::Continue
      }
      InboundFrame::Ping | InboundFrame::Pong => {
        connection.touch();
        SessionControl::Continue
      }
      InboundFrame::Close => SessionControl::Close,
    }
  }

  fn handle_response_text(&self, connection: &Connection, text: &str) -> Option<Resolution> {
    match serde_json::from_str::<ResponseDescriptor>(text) {
      Ok(response) => Some(Correlator::resolve_on(connection, response)),
      Err(error) => {
        tracing::warn!(
          connection = %connection.id(),
          %error,
          "Dropping malformed message from remote client"
        );
        None
      }
    }
  }
}

impl TransportAdapter for PushTransport {
  fn mode(&self) -> TransportMode {
    TransportMode::Push
  }

  fn deliver(
    &self,
    connection: &Connection,
    descriptor: RequestDescriptor,
  ) -> Result<(), DeliveryError> {
    connection
      .transport()
      .send_frame(PushFrame::Request(descriptor))
  }

  fn probe(&self, connection: &Connection) -> Result<(), DeliveryError> {
    connection.transport().send_frame(PushFrame::Ping)
  }
}

/// Lifecycle of one duplex peer, from admission to removal
pub struct PushSession {
  state: PushSessionState,
  connection: Option<Arc<Connection>>,
}

impl PushSession {
  pub fn connecting() -> Self {
    Self {
      state: PushSessionState::Connecting,
      connection: None,
    }
  }

  pub fn state(&self) -> PushSessionState {
    self.state
  }

  pub fn connection(&self) -> Option<&Arc<Connection>> {
    self.connection.as_ref()
  }

  /// A session for a peer whose credential was already verified
  pub fn admitted(registry: &ConnectionRegistry) -> (Self, DuplexEndpoint) {
    let (handle, endpoint) = TransportHandle::duplex();
    let session = Self {
      state: PushSessionState::Open,
      connection: Some(registry.register(handle)),
    };
    (session, endpoint)
  }

  /// Registers the peer; only valid once, after its credential was verified
  pub fn admit(&mut self, registry: &ConnectionRegistry) -> Option<DuplexEndpoint> {
    if self.state != PushSessionState::Connecting {
      return None;
    }
    let (admitted, endpoint) = Self::admitted(registry);
    *self = admitted;
    Some(endpoint)
  }

  pub fn on_frame(&mut self, transport: &PushTransport, frame: InboundFrame) -> SessionControl {
    let connection = match (&self.state, &self.connection) {
      (PushSessionState::Open, Some(connection)) => connection,
      _ => {
        tracing::debug!(state = ?self.state, "Ignoring frame outside of an open session");
        return SessionControl::Close;
      }
    };
    let control = transport.handle_inbound(connection, frame);
    if control == SessionControl::Close {
      self.state = PushSessionState::Closing;
    }
    control
  }

  /// Removes the peer from the registry, failing whatever it still owed
  pub fn close(&mut self, registry: &ConnectionRegistry, reason: TunnelCloseReason) {
    if self.state == PushSessionState::Closed {
      return;
    }
    self.state = PushSessionState::Closing;
    if let Some(connection) = self.connection.as_ref() {
      registry.remove(connection.id(), reason);
    }
    self.state = PushSessionState::Closed;
  }
}

impl Drop for PushSession {
  fn drop(&mut self) {
    if let Some(connection) = self.connection.as_ref() {
      if self.state != PushSessionState::Closed {
        // The registry entry is cleaned up by whoever removes it; the socket is gone either way
        connection.shutdown(TunnelCloseReason::GracefulExit {
          remote_initiated: false,
        });
      }
    }
  }
}
