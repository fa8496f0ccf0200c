// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Identifies one connected peer for the lifetime of a registry
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
  pub fn new(inner: u64) -> ConnectionId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl From<u64> for ConnectionId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl From<ConnectionId> for u64 {
  fn from(id: ConnectionId) -> Self {
    id.inner()
  }
}

impl std::str::FromStr for ConnectionId {
  type Err = std::num::ParseIntError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    s.parse::<u64>().map(ConnectionId::new)
  }
}

impl std::fmt::Debug for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("ConnectionId").field(&self.inner()).finish()
  }
}

impl std::fmt::Display for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

pub trait ConnectionIdGenerator {
  fn next(&self) -> ConnectionId;
}

/// Hands out strictly increasing ids; an id is never produced twice by one generator.
pub struct MonotonicAtomicGenerator {
  next: AtomicU64,
}

impl MonotonicAtomicGenerator {
  pub fn new(next: u64) -> Self {
    Self {
      next: AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> ConnectionId {
    ConnectionId::new(self.next.fetch_add(1, Ordering::Relaxed))
  }
}

impl Default for MonotonicAtomicGenerator {
  fn default() -> Self {
    Self::new(1)
  }
}

impl ConnectionIdGenerator for MonotonicAtomicGenerator {
  fn next(&self) -> ConnectionId {
    MonotonicAtomicGenerator::next(self)
  }
}

/// Correlation token pairing one forwarded request with its response
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
  pub fn new<T: Into<String>>(t: T) -> RequestId {
    RequestId(t.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Debug for RequestId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("RequestId").field(&self.0).finish()
  }
}

impl std::fmt::Display for RequestId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// Produces request ids from a process-wide sequence number plus random entropy.
///
/// The sequence alone is unique within one generator; the random suffix keeps ids
/// from separate processes or restarts from lining up.
#[derive(Default)]
pub struct RequestIdGenerator {
  sequence: AtomicU64,
}

impl RequestIdGenerator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn next(&self) -> RequestId {
    let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
    let entropy = uuid::Uuid::new_v4().simple().to_string();
    RequestId(format!("{:x}-{}", sequence, &entropy[..12]))
  }
}
