// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  net::{IpAddr, Ipv4Addr, SocketAddr},
  time::Duration,
};

use crate::common::protocol::transport::TransportMode;

/// Parameters used to run a relay server
#[derive(Clone, PartialEq, Eq)]
pub struct ServerConfig {
  pub bind_address: IpAddr,
  pub port: u16,
  /// Shared key required from callers and agents; `None` runs the relay open
  pub api_key: Option<String>,
  pub transport_mode: TransportMode,
  /// Probe period for duplex peers; long-polling peers expire after twice this
  pub ping_interval: Duration,
  pub request_timeout: Duration,
  /// Upper bound on how long a single poll may be parked
  pub poll_timeout: Duration,
  pub rate_limit_window: Duration,
  /// Requests allowed per client address in each window; zero disables limiting
  pub rate_limit_max: u32,
  pub socket_path: String,
}

impl ServerConfig {
  pub fn socket_addr(&self) -> SocketAddr {
    SocketAddr::new(self.bind_address, self.port)
  }

  /// The upgrade path, always rooted
  pub fn normalized_socket_path(&self) -> String {
    let trimmed = self.socket_path.trim();
    if trimmed.starts_with('/') {
      trimmed.to_owned()
    } else {
      format!("/{}", trimmed)
    }
  }
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
      port: 3000,
      api_key: None,
      transport_mode: TransportMode::Push,
      ping_interval: Duration::from_millis(30_000),
      request_timeout: Duration::from_millis(30_000),
      poll_timeout: Duration::from_millis(30_000),
      rate_limit_window: Duration::from_millis(60_000),
      rate_limit_max: 100,
      socket_path: "/ws".to_owned(),
    }
  }
}

impl std::fmt::Debug for ServerConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ServerConfig")
      .field("bind_address", &self.bind_address)
      .field("port", &self.port)
      .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
      .field("transport_mode", &self.transport_mode)
      .field("ping_interval", &self.ping_interval)
      .field("request_timeout", &self.request_timeout)
      .field("poll_timeout", &self.poll_timeout)
      .field("rate_limit_window", &self.rate_limit_window)
      .field("rate_limit_max", &self.rate_limit_max)
      .field("socket_path", &self.socket_path)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::ServerConfig;

  #[test]
  fn debug_redacts_the_key() {
    let config = ServerConfig {
      api_key: Some("hunter2".into()),
      ..Default::default()
    };
    let printed = format!("{:?}", config);
    assert!(!printed.contains("hunter2"));
    assert!(printed.contains("<redacted>"));
  }

  #[test]
  fn socket_path_is_rooted() {
    let config = ServerConfig {
      socket_path: "tunnel".into(),
      ..Default::default()
    };
    assert_eq!(config.normalized_socket_path(), "/tunnel");
    assert_eq!(ServerConfig::default().normalized_socket_path(), "/ws");
    assert_eq!(ServerConfig::default().socket_addr().port(), 3000);
  }
}
