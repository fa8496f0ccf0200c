// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Pairs forwarded requests with their responses.
//!
//! Every opened request is completed exactly once: by a matching response, by
//! its deadline, or by eviction of its connection. Whichever gets there first
//! removes the entry from the connection's table; anyone arriving later finds
//! nothing and reports [`Resolution::AlreadyHandled`].

use std::{
  sync::{Arc, Weak},
  time::Duration,
};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
  descriptor::{
    ExchangeFailure, ExchangeOutcome, ForwardedRequest, RequestDescriptor, ResponseDescriptor,
    ResponseSink,
  },
  tunnel::{
    id::{ConnectionId, RequestId, RequestIdGenerator},
    registry::ConnectionRegistry,
    Connection, PendingRequest,
  },
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
  #[error("Connection {0} is not registered")]
  ConnectionNotFound(ConnectionId),
}

/// How a resolution attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
  /// The caller received the peer's response
  Resolved,
  /// The caller received a gateway timeout
  TimedOut,
  /// The exchange was already completed; nothing happened
  AlreadyHandled,
}

/// A request that has been opened and must now be delivered to its peer
#[derive(Debug)]
pub struct OpenedRequest {
  pub connection: Arc<Connection>,
  pub descriptor: RequestDescriptor,
}

pub struct Correlator {
  registry: Arc<ConnectionRegistry>,
  request_ids: RequestIdGenerator,
}

impl Correlator {
  pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
    Self {
      registry,
      request_ids: RequestIdGenerator::new(),
    }
  }

  pub fn registry(&self) -> &Arc<ConnectionRegistry> {
    &self.registry
  }

  /// Registers a new exchange on a connection and arms its deadline.
  ///
  /// On failure the sink is dropped without being completed; the caller still
  /// owns reporting the lookup failure.
  pub fn open(
    &self,
    connection_id: ConnectionId,
    request: ForwardedRequest,
    sink: Box<dyn ResponseSink>,
    timeout: Duration,
  ) -> Result<OpenedRequest, CorrelationError> {
    let connection = self
      .registry
      .get(connection_id)
      .ok_or(CorrelationError::ConnectionNotFound(connection_id))?;

    let request_id = self.request_ids.next();
    let descriptor = request.into_descriptor(request_id.clone());
    let deadline = Instant::now() + timeout;
    let timer = CancellationToken::new();

    {
      let mut state = connection.lock_state();
      // Lost a race with eviction
      if state.closed {
        return Err(CorrelationError::ConnectionNotFound(connection_id));
      }
      state.pending.insert(
        request_id.clone(),
        PendingRequest {
          sink,
          deadline,
          descriptor: descriptor.clone(),
          timer: timer.clone().drop_guard(),
        },
      );
    }

    Self::arm_deadline(Arc::downgrade(&connection), request_id.clone(), deadline, timer);
    tracing::debug!(
      connection = %connection_id,
      request = %request_id,
      method = %descriptor.method,
      path = %descriptor.path,
      "Opened request"
    );

    Ok(OpenedRequest {
      connection,
      descriptor,
    })
  }

  fn arm_deadline(
    connection: Weak<Connection>,
    request_id: RequestId,
    deadline: Instant,
    timer: CancellationToken,
  ) {
    tokio::task::spawn(async move {
      tokio::select! {
        _ = timer.cancelled() => {}
        _ = tokio::time::sleep_until(deadline) => {
          if let Some(connection) = connection.upgrade() {
            Self::expire_on(&connection, &request_id);
          }
        }
      }
    });
  }

  /// Completes an exchange with its peer's response; unknown ids are ignored
  pub fn resolve(&self, connection_id: ConnectionId, response: ResponseDescriptor) -> Resolution {
    match self.registry.get(connection_id) {
      Some(connection) => Self::resolve_on(&connection, response),
      None => {
        tracing::debug!(
          connection = %connection_id,
          request = %response.request_id,
          "Dropping response for a connection that is gone"
        );
        Resolution::AlreadyHandled
      }
    }
  }

  /// Completes an exchange on a connection the caller already holds
  pub fn resolve_on(connection: &Connection, response: ResponseDescriptor) -> Resolution {
    match connection.take_pending(&response.request_id) {
      Some(pending) => {
        tracing::debug!(
          connection = %connection.id(),
          request = %response.request_id,
          status = response.status_code,
          "Resolved request"
        );
        pending.finish(Ok(response));
        Resolution::Resolved
      }
      None => {
        tracing::debug!(
          connection = %connection.id(),
          request = %response.request_id,
          "Ignoring response for an unknown or already completed request"
        );
        Resolution::AlreadyHandled
      }
    }
  }

  /// Completes an exchange with a gateway timeout
  fn expire_on(connection: &Connection, request_id: &RequestId) -> Resolution {
    match connection.take_pending(request_id) {
      Some(pending) => {
        tracing::warn!(
          connection = %connection.id(),
          request = %request_id,
          method = %pending.descriptor.method,
          path = %pending.descriptor.path,
          overdue = ?Instant::now().saturating_duration_since(pending.deadline),
          "Remote client did not respond in time"
        );
        pending.finish(Err(ExchangeFailure::TimedOut));
        Resolution::TimedOut
      }
      None => Resolution::AlreadyHandled,
    }
  }

  /// Completes an exchange with a failure that is neither a timeout nor eviction
  pub fn fail(
    connection: &Connection,
    request_id: &RequestId,
    failure: ExchangeFailure,
  ) -> Option<ExchangeOutcome> {
    let pending = connection.take_pending(request_id)?;
    let outcome: ExchangeOutcome = Err(failure);
    pending.finish(outcome.clone());
    Some(outcome)
  }
}
