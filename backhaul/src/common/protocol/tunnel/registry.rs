// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast::{channel as event_channel, Receiver, Sender as Broadcaster};

use super::{
  id::{ConnectionId, ConnectionIdGenerator, MonotonicAtomicGenerator},
  Connection, EvictionReport, TransportHandle, TunnelCloseReason,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
  Registered(ConnectionId),
  Removed {
    id: ConnectionId,
    reason: TunnelCloseReason,
    report: EvictionReport,
  },
}

/// Authoritative table of connected peers.
///
/// Ids come from a monotonic generator owned by the registry, so an id is never
/// handed out twice while the registry lives.
pub struct ConnectionRegistry {
  connections: DashMap<ConnectionId, Arc<Connection>>,
  id_generator: Box<dyn ConnectionIdGenerator + Send + Sync + 'static>,
  events: Broadcaster<RegistryEvent>,
}

impl ConnectionRegistry {
  pub fn new() -> Self {
    Self::with_id_generator(MonotonicAtomicGenerator::default())
  }

  pub fn with_id_generator<G>(id_generator: G) -> Self
  where
    G: ConnectionIdGenerator + Send + Sync + 'static,
  {
    Self {
      connections: DashMap::new(),
      id_generator: Box::new(id_generator),
      // Receivers are created on demand through `subscribe`
      events: event_channel(64).0,
    }
  }

  /// Admits a new peer; callers must have verified its credential beforehand
  pub fn register(&self, transport: TransportHandle) -> Arc<Connection> {
    let id = self.id_generator.next();
    let connection = Arc::new(Connection::new(id, transport));
    let previous = self.connections.insert(id, Arc::clone(&connection));
    debug_assert!(previous.is_none(), "Connection ids must be unique");
    tracing::info!(connection = %id, "Remote client connected");
    // Ignore error as it occurs only when no receivers exist to read the event
    let _ = self.events.send(RegistryEvent::Registered(id));
    connection
  }

  pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
    self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
  }

  /// Refreshes liveness for a peer, returning false when it is not connected
  pub fn touch(&self, id: ConnectionId) -> bool {
    match self.connections.get(&id) {
      Some(entry) => {
        entry.value().touch();
        true
      }
      None => false,
    }
  }

  /// Force-resolves everything outstanding on a connection, then forgets it.
  ///
  /// Returns `None` when the id is unknown or was already removed.
  pub fn remove(&self, id: ConnectionId, reason: TunnelCloseReason) -> Option<EvictionReport> {
    let connection = self.get(id)?;
    let report = connection.shutdown(reason.clone());
    // Only the caller that takes the entry out of the map reports the removal
    self
      .connections
      .remove_if(&id, |_, current| Arc::ptr_eq(current, &connection))?;
    tracing::info!(
      connection = %id,
      %reason,
      requests = report.requests,
      polls = report.polls,
      "Remote client disconnected"
    );
    let _ = self.events.send(RegistryEvent::Removed { id, reason, report });
    Some(report)
  }

  pub fn len(&self) -> usize {
    self.connections.len()
  }

  pub fn is_empty(&self) -> bool {
    self.connections.is_empty()
  }

  /// Connections at the time of the call, ordered by id
  pub fn snapshot(&self) -> Vec<Arc<Connection>> {
    let mut connections: Vec<_> = self
      .connections
      .iter()
      .map(|entry| Arc::clone(entry.value()))
      .collect();
    connections.sort_by_key(|connection| connection.id());
    connections
  }

  pub fn subscribe(&self) -> Receiver<RegistryEvent> {
    self.events.subscribe()
  }

  /// Evicts every connection, as done on relay shutdown
  pub fn clear(&self, reason: TunnelCloseReason) {
    for connection in self.snapshot() {
      self.remove(connection.id(), reason.clone());
    }
  }
}

impl Default for ConnectionRegistry {
  fn default() -> Self {
    Self::new()
  }
}
