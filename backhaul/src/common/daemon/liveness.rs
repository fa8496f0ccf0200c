// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Periodic eviction of silent peers.
//!
//! Duplex peers are probed once per period and must answer before the next
//! sweep. Long-polling peers are judged by how long ago they last polled,
//! heartbeated, or posted a result.

use std::{sync::Arc, time::Duration};

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::common::protocol::{
  transport::{Transport, TransportMode},
  tunnel::{registry::ConnectionRegistry, TunnelCloseReason},
};

pub struct LivenessMonitor {
  registry: Arc<ConnectionRegistry>,
  transport: Transport,
  interval: Duration,
}

impl LivenessMonitor {
  pub fn new(registry: Arc<ConnectionRegistry>, transport: Transport, interval: Duration) -> Self {
    Self {
      registry,
      transport,
      interval,
    }
  }

  /// Runs one liveness cycle over every connection, returning how many were evicted
  pub fn sweep(&self) -> usize {
    let mut evicted = 0;
    let now = Instant::now();
    for connection in self.registry.snapshot() {
      let reason = match self.transport.mode() {
        TransportMode::Push => {
          if !connection.take_alive() {
            Some(TunnelCloseReason::LivenessTimeout)
          } else {
            match self.transport.adapter().probe(&connection) {
              Ok(()) => None,
              Err(error) => Some(TunnelCloseReason::transport_error(error)),
            }
          }
        }
        TransportMode::Pull => {
          let silence = now.saturating_duration_since(connection.last_seen());
          if silence > self.interval * 2 {
            Some(TunnelCloseReason::LivenessTimeout)
          } else {
            None
          }
        }
      };
      if let Some(reason) = reason {
        tracing::warn!(connection = %connection.id(), %reason, "Evicting unresponsive remote client");
        if self.registry.remove(connection.id(), reason).is_some() {
          evicted += 1;
        }
      }
    }
    evicted
  }

  /// Sweeps once per interval until `shutdown` fires; the first sweep happens one interval in
  pub fn run(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = shutdown.cancelled() => break,
          _ = ticker.tick() => {
            let evicted = self.sweep();
            tracing::trace!(evicted, remaining = self.registry.len(), "Liveness sweep complete");
          }
        }
      }
    })
  }
}
