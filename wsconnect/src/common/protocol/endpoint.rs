// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use super::{
  session::{Message, Session},
  ConnectError,
};

/// Caller-supplied receiver of connection lifecycle notifications
///
/// Callbacks run on the task driving the connection, never on the caller's task.
pub trait Endpoint: Send + Sync {
  fn on_connect(&self, session: &Session);

  fn on_message(&self, _session: &Session, _message: Message) {}

  fn on_error(&self, error: &ConnectError);

  fn on_close(&self, code: u16, reason: &str);
}

/// Delivers notifications to an [Endpoint], enforcing at-most-once open and terminal delivery
pub struct EndpointDispatcher {
  endpoint: Arc<dyn Endpoint>,
  opened: AtomicBool,
  terminated: AtomicBool,
}

impl EndpointDispatcher {
  pub fn new(endpoint: Arc<dyn Endpoint>) -> Self {
    Self {
      endpoint,
      opened: AtomicBool::new(false),
      terminated: AtomicBool::new(false),
    }
  }

  /// Delivers `on_connect` unless already delivered or the attempt already terminated
  pub fn open(&self, session: &Session) -> bool {
    if self.terminated.load(Ordering::Acquire) || self.opened.swap(true, Ordering::AcqRel) {
      return false;
    }
    tracing::trace!(session_id = ?session.id(), "endpoint_open");
    self.endpoint.on_connect(session);
    true
  }

  pub fn message(&self, session: &Session, message: Message) {
    if self.opened.load(Ordering::Acquire) && !self.terminated.load(Ordering::Acquire) {
      self.endpoint.on_message(session, message);
    }
  }

  /// Delivers the terminal `on_error`; only the first terminal notification is delivered
  pub fn error(&self, error: &ConnectError) -> bool {
    if self.terminated.swap(true, Ordering::AcqRel) {
      tracing::trace!(error = %error, "endpoint_error_suppressed");
      return false;
    }
    self.endpoint.on_error(error);
    true
  }

  /// Delivers the terminal `on_close`; only the first terminal notification is delivered
  pub fn close(&self, code: u16, reason: &str) -> bool {
    if self.terminated.swap(true, Ordering::AcqRel) {
      tracing::trace!(code, "endpoint_close_suppressed");
      return false;
    }
    self.endpoint.on_close(code, reason);
    true
  }

  pub fn is_opened(&self) -> bool {
    self.opened.load(Ordering::Acquire)
  }

  pub fn is_terminated(&self) -> bool {
    self.terminated.load(Ordering::Acquire)
  }
}

impl std::fmt::Debug for EndpointDispatcher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EndpointDispatcher")
      .field("opened", &self.is_opened())
      .field("terminated", &self.is_terminated())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  };

  use super::{Endpoint, EndpointDispatcher};
  use crate::common::protocol::{session::Session, ConnectError};

  #[derive(Default)]
  struct Counting {
    connects: AtomicUsize,
    errors: AtomicUsize,
    closes: AtomicUsize,
  }

  impl Endpoint for Counting {
    fn on_connect(&self, _session: &Session) {
      self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, _error: &ConnectError) {
      self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&self, _code: u16, _reason: &str) {
      self.closes.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[test]
  fn open_is_delivered_once() {
    let endpoint = Arc::new(Counting::default());
    let dispatcher = EndpointDispatcher::new(endpoint.clone());
    let session = Session::detached_for_test();
    assert!(dispatcher.open(&session));
    assert!(!dispatcher.open(&session));
    assert_eq!(endpoint.connects.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn only_first_terminal_notification_is_delivered() {
    let endpoint = Arc::new(Counting::default());
    let dispatcher = EndpointDispatcher::new(endpoint.clone());
    assert!(dispatcher.error(&ConnectError::Cancelled));
    assert!(!dispatcher.close(1000, ""));
    assert!(!dispatcher.error(&ConnectError::Aborted));
    assert_eq!(endpoint.errors.load(Ordering::SeqCst), 1);
    assert_eq!(endpoint.closes.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn no_open_after_termination() {
    let endpoint = Arc::new(Counting::default());
    let dispatcher = EndpointDispatcher::new(endpoint.clone());
    dispatcher.error(&ConnectError::Cancelled);
    assert!(!dispatcher.open(&Session::detached_for_test()));
    assert_eq!(endpoint.connects.load(Ordering::SeqCst), 0);
  }
}
