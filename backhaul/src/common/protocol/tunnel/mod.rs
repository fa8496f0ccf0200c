// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-peer connection state.
//!
//! A [`Connection`] owns everything outstanding for one peer: the requests
//! awaiting a response, descriptors not yet handed to a poller, and parked
//! pollers. All of it sits behind one lock so eviction can take the whole
//! state in a single step.

use std::{
  collections::{HashMap, VecDeque},
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
  },
};

use tokio::{
  sync::{mpsc, oneshot},
  time::Instant,
};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::{
  descriptor::{ExchangeFailure, ExchangeOutcome, RequestDescriptor, ResponseSink},
  transport::{push::PushFrame, DeliveryError},
};

pub mod id;
pub mod registry;

pub use self::id::{ConnectionId, RequestId};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelCloseReason {
  #[error(
    "Connection closed gracefully - initiator: {}",
    if *(.remote_initiated) { "remote" } else { "local" },
  )]
  GracefulExit {
    /// Marks that the remote was or was not the initiator for the exit
    remote_initiated: bool,
  },
  #[error("Connection missed its liveness deadline")]
  LivenessTimeout,
  #[error("Connection closed due to transport error: {0}")]
  TransportError(Arc<String>),
  #[error("Relay is shutting down")]
  Shutdown,
}

impl TunnelCloseReason {
  pub fn transport_error<T: std::fmt::Display>(error: T) -> Self {
    Self::TransportError(Arc::new(error.to_string()))
  }
}

/// The connection's exclusive handle on its transport
pub enum TransportHandle {
  /// A live duplex channel; frames are written by the session task owning the socket
  Duplex {
    frames: mpsc::UnboundedSender<PushFrame>,
    closer: CancellationToken,
  },
  /// Long-poll peers hold no channel; work waits in the connection's delivery queue
  LongPoll,
}

/// Session-side half of a duplex handle
pub struct DuplexEndpoint {
  pub frames: mpsc::UnboundedReceiver<PushFrame>,
  pub closer: CancellationToken,
}

impl TransportHandle {
  pub fn duplex() -> (TransportHandle, DuplexEndpoint) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let closer = CancellationToken::new();
    (
      TransportHandle::Duplex {
        frames: sender,
        closer: closer.clone(),
      },
      DuplexEndpoint {
        frames: receiver,
        closer,
      },
    )
  }

  pub fn send_frame(&self, frame: PushFrame) -> Result<(), DeliveryError> {
    match self {
      TransportHandle::Duplex { frames, closer } => {
        if closer.is_cancelled() {
          return Err(DeliveryError::ConnectionClosed);
        }
        frames
          .send(frame)
          .map_err(|_| DeliveryError::ConnectionClosed)
      }
      TransportHandle::LongPoll => Err(DeliveryError::WrongTransport),
    }
  }

  fn close(&self) {
    if let TransportHandle::Duplex { closer, .. } = self {
      closer.cancel();
    }
  }
}

impl std::fmt::Debug for TransportHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TransportHandle::Duplex { closer, .. } => f
        .debug_struct("Duplex")
        .field("closed", &closer.is_cancelled())
        .finish_non_exhaustive(),
      TransportHandle::LongPoll => f.write_str("LongPoll"),
    }
  }
}

/// One in-flight public exchange
pub(crate) struct PendingRequest {
  pub(crate) sink: Box<dyn ResponseSink>,
  pub(crate) deadline: Instant,
  pub(crate) descriptor: RequestDescriptor,
  /// Cancels the deadline timer when dropped
  pub(crate) timer: DropGuard,
}

impl PendingRequest {
  pub(crate) fn finish(self, outcome: ExchangeOutcome) {
    let PendingRequest { sink, timer, .. } = self;
    drop(timer);
    sink.complete(outcome);
  }
}

pub(crate) struct ParkedPoll {
  pub(crate) id: u64,
  pub(crate) sender: oneshot::Sender<RequestDescriptor>,
}

#[derive(Default)]
pub(crate) struct ConnectionState {
  pub(crate) pending: HashMap<RequestId, PendingRequest>,
  /// Opened but not yet handed to a poller, oldest first
  pub(crate) undelivered: VecDeque<RequestDescriptor>,
  /// Pollers waiting for work, oldest first
  pub(crate) parked_polls: VecDeque<ParkedPoll>,
  pub(crate) closed: bool,
}

/// What eviction had to force-resolve
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionReport {
  pub requests: usize,
  pub polls: usize,
}

pub struct Connection {
  id: ConnectionId,
  transport: TransportHandle,
  alive: AtomicBool,
  last_seen: Mutex<Instant>,
  state: Mutex<ConnectionState>,
}

impl Connection {
  pub fn new(id: ConnectionId, transport: TransportHandle) -> Self {
    Self {
      id,
      transport,
      alive: AtomicBool::new(true),
      last_seen: Mutex::new(Instant::now()),
      state: Mutex::new(ConnectionState::default()),
    }
  }

  pub fn id(&self) -> ConnectionId {
    self.id
  }

  pub fn transport(&self) -> &TransportHandle {
    &self.transport
  }

  /// Records inbound activity from the peer
  pub fn touch(&self) {
    *self.last_seen.lock().expect("Connection timestamp lock poisoned") = Instant::now();
    self.alive.store(true, Ordering::Release);
  }

  pub fn mark_alive(&self) {
    self.alive.store(true, Ordering::Release);
  }

  pub fn is_alive(&self) -> bool {
    self.alive.load(Ordering::Acquire)
  }

  /// Clears the liveness flag, returning whether it was set
  pub fn take_alive(&self) -> bool {
    self.alive.swap(false, Ordering::AcqRel)
  }

  pub fn last_seen(&self) -> Instant {
    *self.last_seen.lock().expect("Connection timestamp lock poisoned")
  }

  pub fn pending_count(&self) -> usize {
    self.lock_state().pending.len()
  }

  pub fn undelivered_count(&self) -> usize {
    self.lock_state().undelivered.len()
  }

  pub fn parked_poll_count(&self) -> usize {
    self.lock_state().parked_polls.len()
  }

  pub fn is_closed(&self) -> bool {
    self.lock_state().closed
  }

  pub(crate) fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
    self.state.lock().expect("Connection state lock poisoned")
  }

  /// Removes an exchange, along with its descriptor if no poller has taken it yet
  pub(crate) fn take_pending(&self, request_id: &RequestId) -> Option<PendingRequest> {
    let mut state = self.lock_state();
    let pending = state.pending.remove(request_id)?;
    state
      .undelivered
      .retain(|descriptor| &descriptor.request_id != request_id);
    Some(pending)
  }

  /// Closes the connection and force-resolves everything outstanding on it.
  ///
  /// Pending requests complete with [`ExchangeFailure::ConnectionLost`]; parked
  /// pollers observe their sender being dropped, which they report as gone.
  /// Calling this on an already closed connection does nothing.
  pub fn shutdown(&self, reason: TunnelCloseReason) -> EvictionReport {
    let (pending, parked) = {
      let mut state = self.lock_state();
      if state.closed {
        return EvictionReport::default();
      }
      state.closed = true;
      state.undelivered.clear();
      (
        std::mem::take(&mut state.pending),
        std::mem::take(&mut state.parked_polls),
      )
    };
    self.transport.close();

    let report = EvictionReport {
      requests: pending.len(),
      polls: parked.len(),
    };
    for (_request_id, request) in pending {
      request.finish(Err(ExchangeFailure::ConnectionLost(reason.clone())));
    }
    drop(parked);
    report
  }
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("id", &self.id)
      .field("transport", &self.transport)
      .field("alive", &self.is_alive())
      .finish_non_exhaustive()
  }
}
