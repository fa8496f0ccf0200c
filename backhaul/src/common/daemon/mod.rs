// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{sync::Arc, time::Duration};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::common::{
  authentication::AuthenticationHandler,
  protocol::{
    correlator::{CorrelationError, Correlator},
    descriptor::{ExchangeFailure, ForwardedRequest, ResponseDescriptor},
    transport::{push::PushSession, Transport, TransportMode},
    tunnel::{
      id::ConnectionId,
      registry::ConnectionRegistry,
      Connection, DuplexEndpoint, EvictionReport, TransportHandle, TunnelCloseReason,
    },
  },
};

pub mod liveness;

pub use liveness::LivenessMonitor;

#[derive(thiserror::Error, Debug, Clone)]
pub enum ForwardError {
  #[error("Remote client {0} is not connected")]
  NotConnected(ConnectionId),
  #[error(transparent)]
  Exchange(#[from] ExchangeFailure),
}

impl From<CorrelationError> for ForwardError {
  fn from(error: CorrelationError) -> Self {
    match error {
      CorrelationError::ConnectionNotFound(id) => ForwardError::NotConnected(id),
    }
  }
}

/// Relay core: the registry, the correlator, and the configured transport
pub struct RelayDaemon {
  registry: Arc<ConnectionRegistry>,
  correlator: Correlator,
  transport: Transport,
  authentication_handler: Arc<dyn AuthenticationHandler>,
  request_timeout: Duration,
}

impl RelayDaemon {
  pub fn new(
    mode: TransportMode,
    authentication_handler: Arc<dyn AuthenticationHandler>,
    request_timeout: Duration,
  ) -> Self {
    let registry = Arc::new(ConnectionRegistry::new());
    Self {
      correlator: Correlator::new(Arc::clone(&registry)),
      registry,
      transport: Transport::for_mode(mode),
      authentication_handler,
      request_timeout,
    }
  }

  pub fn registry(&self) -> &Arc<ConnectionRegistry> {
    &self.registry
  }

  pub fn correlator(&self) -> &Correlator {
    &self.correlator
  }

  pub fn transport(&self) -> &Transport {
    &self.transport
  }

  pub fn mode(&self) -> TransportMode {
    self.transport.mode()
  }

  pub fn authentication_handler(&self) -> &Arc<dyn AuthenticationHandler> {
    &self.authentication_handler
  }

  pub fn request_timeout(&self) -> Duration {
    self.request_timeout
  }

  /// Sends a public request through a peer and waits for its outcome.
  ///
  /// Always completes: with the peer's response, a timeout, or a failure once
  /// the peer is evicted.
  pub async fn forward(
    &self,
    connection_id: ConnectionId,
    request: ForwardedRequest,
  ) -> Result<ResponseDescriptor, ForwardError> {
    let (sender, receiver) = oneshot::channel();
    let opened = self
      .correlator
      .open(connection_id, request, Box::new(sender), self.request_timeout)?;
    let request_id = opened.descriptor.request_id.clone();

    if let Err(error) = self
      .transport
      .adapter()
      .deliver(&opened.connection, opened.descriptor)
    {
      tracing::warn!(
        connection = %connection_id,
        request = %request_id,
        %error,
        "Failed to deliver request to remote client"
      );
      Correlator::fail(&opened.connection, &request_id, ExchangeFailure::Undeliverable);
    }

    match receiver.await {
      Ok(outcome) => outcome.map_err(ForwardError::from),
      // Every opened request is completed, so this only happens if the sink was lost in a panic
      Err(_) => Err(ForwardError::Exchange(ExchangeFailure::Undeliverable)),
    }
  }

  /// Admits a duplex peer whose credential was already checked
  pub fn register_push(&self) -> (PushSession, DuplexEndpoint) {
    PushSession::admitted(&self.registry)
  }

  /// Admits a long-polling peer whose credential was already checked
  pub fn register_pull(&self) -> Arc<Connection> {
    self.registry.register(TransportHandle::LongPoll)
  }

  pub fn evict(&self, connection_id: ConnectionId, reason: TunnelCloseReason) -> Option<EvictionReport> {
    self.registry.remove(connection_id, reason)
  }

  /// Runs the liveness monitor until shutdown, then evicts every remaining peer
  pub fn run(
    self: &Arc<Self>,
    probe_interval: Duration,
    shutdown: CancellationToken,
  ) -> tokio::task::JoinHandle<()> {
    let this = Arc::clone(self);
    let monitor = LivenessMonitor::new(Arc::clone(&self.registry), self.transport.clone(), probe_interval);
    let span = tracing::span!(tracing::Level::DEBUG, "relay", mode = %self.mode());
    tokio::task::spawn(
      async move {
        if let Err(error) = monitor.run(shutdown).await {
          tracing::error!(%error, "Liveness monitor exited unexpectedly");
        }
        this.registry.clear(TunnelCloseReason::Shutdown);
        tracing::debug!("Relay stopped");
      }
      .instrument(span),
    )
  }
}

impl std::fmt::Debug for RelayDaemon {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RelayDaemon")
      .field("mode", &self.mode())
      .field("connections", &self.registry.len())
      .field("authentication_handler", &self.authentication_handler)
      .field("request_timeout", &self.request_timeout)
      .finish()
  }
}
