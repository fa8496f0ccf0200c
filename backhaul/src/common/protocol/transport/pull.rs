// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Long-poll transport.
//!
//! Descriptors that find no parked poller wait in the connection's delivery
//! queue. A poll takes the oldest queued descriptor, or parks until one is
//! opened or its wait runs out.

use std::{
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::Duration,
};

use tokio::sync::oneshot;

use super::{DeliveryError, TransportAdapter, TransportMode};
use crate::common::protocol::{
  correlator::{Correlator, Resolution},
  descriptor::{RequestDescriptor, ResponseDescriptor},
  tunnel::{Connection, ConnectionState, ParkedPoll},
};

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
  Delivered(RequestDescriptor),
  /// The wait expired with nothing to hand out; poll again
  Empty,
  /// The connection was evicted while the poll was parked
  Gone,
}

#[derive(Debug, Default)]
pub struct PullTransport {
  poll_ids: AtomicU64,
}

impl PullTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Fetches the next descriptor for a peer, parking for at most `wait`
  pub async fn poll(&self, connection: &Arc<Connection>, wait: Duration) -> PollOutcome {
    connection.touch();
    let (poll_id, receiver) = {
      let mut state = connection.lock_state();
      if state.closed {
        return PollOutcome::Gone;
      }
      if let Some(descriptor) = state.undelivered.pop_front() {
        tracing::trace!(connection = %connection.id(), request = %descriptor.request_id, "Delivered queued request");
        return PollOutcome::Delivered(descriptor);
      }
      let (sender, receiver) = oneshot::channel();
      let poll_id = self.poll_ids.fetch_add(1, Ordering::Relaxed);
      state.parked_polls.push_back(ParkedPoll {
        id: poll_id,
        sender,
      });
      (poll_id, receiver)
    };

    ParkedPollGuard {
      connection: Arc::clone(connection),
      poll_id,
      receiver: Some(receiver),
    }
    .wait(wait)
    .await
  }

  /// Feeds a peer's posted result to the correlator; unknown ids are accepted and ignored
  pub fn post_result(&self, connection: &Connection, response: ResponseDescriptor) -> Resolution {
    connection.touch();
    Correlator::resolve_on(connection, response)
  }
}

/// Hands a descriptor to the oldest live parked poller, or queues it.
///
/// `requeue` puts a descriptor that was already in flight back at the head of the queue.
fn hand_off(state: &mut ConnectionState, mut descriptor: RequestDescriptor, requeue: bool) {
  while let Some(parked) = state.parked_polls.pop_front() {
    match parked.sender.send(descriptor) {
      Ok(()) => return,
      // That poller's caller went away; try the next one
      Err(returned) => descriptor = returned,
    }
  }
  if requeue {
    state.undelivered.push_front(descriptor);
  } else {
    state.undelivered.push_back(descriptor);
  }
}

impl TransportAdapter for PullTransport {
  fn mode(&self) -> TransportMode {
    TransportMode::Pull
  }

  fn deliver(
    &self,
    connection: &Connection,
    descriptor: RequestDescriptor,
  ) -> Result<(), DeliveryError> {
    let mut state = connection.lock_state();
    if state.closed {
      return Err(DeliveryError::ConnectionClosed);
    }
    hand_off(&mut state, descriptor, false);
    Ok(())
  }

  fn probe(&self, _connection: &Connection) -> Result<(), DeliveryError> {
    // Pull peers prove liveness by polling and heartbeating
    Ok(())
  }
}

/// A parked poll; dropping it before completion unparks it and returns any
/// descriptor that raced the drop to the queue.
struct ParkedPollGuard {
  connection: Arc<Connection>,
  poll_id: u64,
  receiver: Option<oneshot::Receiver<RequestDescriptor>>,
}

impl ParkedPollGuard {
  async fn wait(mut self, wait: Duration) -> PollOutcome {
    // The receiver stays in `self` across awaits so dropping this future still runs `Drop`
    let waited = match self.receiver.as_mut() {
      Some(receiver) => tokio::time::timeout(wait, receiver).await,
      None => return PollOutcome::Gone,
    };
    let received = match waited {
      Ok(received) => received,
      Err(_elapsed) => {
        if self.unpark() {
          self.receiver = None;
          return PollOutcome::Empty;
        }
        // Someone took the sender just as the wait ran out: its answer is already in the channel
        match self.receiver.as_mut() {
          Some(receiver) => receiver.await,
          None => return PollOutcome::Gone,
        }
      }
    };
    self.receiver = None;
    match received {
      Ok(descriptor) => PollOutcome::Delivered(descriptor),
      Err(_) => PollOutcome::Gone,
    }
  }

  fn unpark(&self) -> bool {
    let mut state = self.connection.lock_state();
    let before = state.parked_polls.len();
    state.parked_polls.retain(|parked| parked.id != self.poll_id);
    state.parked_polls.len() != before
  }
}

impl Drop for ParkedPollGuard {
  fn drop(&mut self) {
    let mut receiver = match self.receiver.take() {
      Some(receiver) => receiver,
      None => return,
    };
    self.unpark();
    receiver.close();
    if let Ok(descriptor) = receiver.try_recv() {
      let mut state = self.connection.lock_state();
      // Nothing to requeue if the exchange already timed out or failed
      if !state.closed && state.pending.contains_key(&descriptor.request_id) {
        tracing::debug!(
          connection = %self.connection.id(),
          request = %descriptor.request_id,
          "Poller went away; requeueing request"
        );
        hand_off(&mut state, descriptor, true);
      }
    }
  }
}
