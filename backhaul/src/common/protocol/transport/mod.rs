// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Delivery of request descriptors to peers.
//!
//! Both strategies share the registry and the correlator; they only differ in
//! how a descriptor reaches the peer and how liveness is established.

use std::{str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

use super::{descriptor::RequestDescriptor, tunnel::Connection};

pub mod pull;
pub mod push;

pub use pull::{PollOutcome, PullTransport};
pub use push::{PushFrame, PushTransport};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
  #[error("Connection is closed")]
  ConnectionClosed,
  #[error("Connection does not use this transport")]
  WrongTransport,
}

/// Which transport strategy a relay or agent runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
  /// Duplex WebSocket channel; the relay writes requests as they arrive
  #[default]
  Push,
  /// Long-polling; the peer fetches requests and posts results back
  Pull,
}

impl FromStr for TransportMode {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "push" | "ws" | "websocket" => Ok(TransportMode::Push),
      "pull" | "poll" | "long-poll" | "longpoll" => Ok(TransportMode::Pull),
      other => Err(anyhow::Error::msg(format!(
        "Unknown transport mode {:?}; expected \"push\" or \"pull\"",
        other
      ))),
    }
  }
}

impl std::fmt::Display for TransportMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TransportMode::Push => f.write_str("push"),
      TransportMode::Pull => f.write_str("pull"),
    }
  }
}

pub trait TransportAdapter: Send + Sync + 'static {
  fn mode(&self) -> TransportMode;

  /// Hands a freshly opened descriptor towards the peer without waiting on it
  fn deliver(
    &self,
    connection: &Connection,
    descriptor: RequestDescriptor,
  ) -> Result<(), DeliveryError>;

  /// Sends an active liveness probe; transports without one succeed trivially
  fn probe(&self, connection: &Connection) -> Result<(), DeliveryError>;
}

/// The transport a relay was configured with
#[derive(Clone)]
pub enum Transport {
  Push(Arc<PushTransport>),
  Pull(Arc<PullTransport>),
}

impl Transport {
  pub fn for_mode(mode: TransportMode) -> Self {
    match mode {
      TransportMode::Push => Transport::Push(Arc::new(PushTransport::new())),
      TransportMode::Pull => Transport::Pull(Arc::new(PullTransport::new())),
    }
  }

  pub fn adapter(&self) -> &dyn TransportAdapter {
    match self {
      Transport::Push(push) => push.as_ref(),
      Transport::Pull(pull) => pull.as_ref(),
    }
  }

  pub fn mode(&self) -> TransportMode {
    self.adapter().mode()
  }

  pub fn as_pull(&self) -> Option<&Arc<PullTransport>> {
    match self {
      Transport::Pull(pull) => Some(pull),
      Transport::Push(_) => None,
    }
  }

  pub fn as_push(&self) -> Option<&Arc<PushTransport>> {
    match self {
      Transport::Push(push) => Some(push),
      Transport::Pull(_) => None,
    }
  }
}
