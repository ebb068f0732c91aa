// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one connect attempt and the session it produces
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SessionId(u64);

impl SessionId {
  pub const fn new(inner: u64) -> SessionId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl From<u64> for SessionId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl std::fmt::Debug for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "SessionId({})", self.0)
  }
}

impl std::fmt::Display for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "session-{}", self.0)
  }
}

/// Source of ids handed to new connect attempts
///
/// Called once per `connect`, from whichever task calls it.
pub trait SessionIdGenerator: Send + Sync {
  fn next(&self) -> SessionId;
}

/// Hands out ids in increasing order, starting from a fixed first id
pub struct SequentialSessionIds {
  upcoming: AtomicU64,
}

impl SequentialSessionIds {
  pub fn starting_at(first: u64) -> Self {
    Self {
      upcoming: AtomicU64::new(first),
    }
  }
}

impl Default for SequentialSessionIds {
  fn default() -> Self {
    Self::starting_at(1)
  }
}

impl SessionIdGenerator for SequentialSessionIds {
  fn next(&self) -> SessionId {
    SessionId::new(self.upcoming.fetch_add(1, Ordering::Relaxed))
  }
}
