// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The caller-facing handle of a single connect attempt
//!
//! An outcome resolves exactly once, to one of cancelled, succeeded, or failed.
//! The resolution is a single compare-and-swap away from pending, so a
//! cancellation racing a success has exactly one winner, and whichever loses
//! observes the winner's state instead.

use std::{
  sync::{
    atomic::{AtomicU8, Ordering},
    Arc, Mutex, PoisonError, Weak,
  },
  time::Duration,
};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{process::Phase, session::Session, ConnectError};
use crate::util::cancellation::CancellationListener;

/// Resolution state of a [ConnectOutcome]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeState {
  Pending = 0,
  Cancelled = 1,
  Succeeded = 2,
  Failed = 3,
}

// A resolver won the race and is storing its result; never observable as a terminal state
const COMPLETING: u8 = 4;

impl OutcomeState {
  fn from_raw(raw: u8) -> Self {
    match raw {
      1 => Self::Cancelled,
      2 => Self::Succeeded,
      3 => Self::Failed,
      _ => Self::Pending,
    }
  }

  pub fn is_terminal(&self) -> bool {
    !matches!(self, Self::Pending)
  }
}

struct Shared {
  state: AtomicU8,
  phase: AtomicU8,
  result: Mutex<Option<Result<Session, ConnectError>>>,
  resolved: watch::Sender<bool>,
  interrupt: CancellationToken,
}

impl Shared {
  /// Reads the state, waiting out the brief window in which a winning resolver stores its result
  fn settled_state(&self) -> OutcomeState {
    loop {
      match self.state.load(Ordering::Acquire) {
        COMPLETING => std::hint::spin_loop(),
        raw => return OutcomeState::from_raw(raw),
      }
    }
  }

  fn resolve(&self, result: Result<Session, ConnectError>) -> Result<(), OutcomeState> {
    let terminal = match &result {
      Ok(_) => OutcomeState::Succeeded,
      Err(_) => OutcomeState::Failed,
    };
    if self
      .state
      .compare_exchange(
        OutcomeState::Pending as u8,
        COMPLETING,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_err()
    {
      return Err(self.settled_state());
    }
    *self.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
    if terminal == OutcomeState::Succeeded {
      // Waiters woken by success must observe the open phase
      self.phase.store(Phase::Open as u8, Ordering::Release);
    }
    self.state.store(terminal as u8, Ordering::Release);
    self.resolved.send_replace(true);
    Ok(())
  }

  fn fail(&self, error: ConnectError) -> Result<(), OutcomeState> {
    let description = error.to_string();
    let res = self.resolve(Err(error));
    if res.is_ok() {
      tracing::debug!(error = %description, "connect_outcome_failed");
    }
    res
  }
}

/// Cancellable, awaitable result of an asynchronous connect
///
/// Clones share the same underlying attempt.
#[derive(Clone)]
pub struct ConnectOutcome {
  shared: Arc<Shared>,
}

impl ConnectOutcome {
  pub(crate) fn new() -> Self {
    let (resolved, _) = watch::channel(false);
    Self {
      shared: Arc::new(Shared {
        state: AtomicU8::new(OutcomeState::Pending as u8),
        phase: AtomicU8::new(Phase::Dialing as u8),
        result: Mutex::new(None),
        resolved,
        interrupt: CancellationToken::new(),
      }),
    }
  }

  /// Attempts to cancel the connect
  ///
  /// Returns `true` only if this call moved the outcome from pending to
  /// cancelled. With `may_interrupt`, a session already handed to the endpoint's
  /// `on_connect` has its transport torn down immediately rather than once
  /// `on_connect` returns.
  pub fn cancel(&self, may_interrupt: bool) -> bool {
    let won = self
      .shared
      .state
      .compare_exchange(
        OutcomeState::Pending as u8,
        OutcomeState::Cancelled as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_ok();
    if won {
      tracing::debug!(phase = ?self.phase(), may_interrupt, "connect_cancelled");
      if may_interrupt {
        self.shared.interrupt.cancel();
      }
      self.shared.resolved.send_replace(true);
    }
    won
  }

  /// Waits for resolution, optionally bounded
  ///
  /// An elapsed bound yields [ConnectError::TimedOut] and leaves the outcome pending.
  pub async fn get(&self, timeout: Option<Duration>) -> Result<Session, ConnectError> {
    match timeout {
      None => self.wait().await,
      Some(timeout) => tokio::time::timeout(timeout, self.wait())
        .await
        .unwrap_or(Err(ConnectError::TimedOut)),
    }
  }

  /// Waits for resolution without bound
  pub async fn wait(&self) -> Result<Session, ConnectError> {
    let mut resolved = self.shared.resolved.subscribe();
    loop {
      if let Some(result) = self.try_get() {
        return result;
      }
      if resolved.changed().await.is_err() {
        // The sender lives as long as any handle; unreachable while we hold one
        return Err(ConnectError::Aborted);
      }
    }
  }

  /// Returns the result if the outcome has resolved
  pub fn try_get(&self) -> Option<Result<Session, ConnectError>> {
    match self.shared.state.load(Ordering::Acquire) {
      raw if raw == OutcomeState::Cancelled as u8 => Some(Err(ConnectError::Cancelled)),
      raw if raw == OutcomeState::Succeeded as u8 || raw == OutcomeState::Failed as u8 => self
        .shared
        .result
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone(),
      _ => None,
    }
  }

  pub fn state(&self) -> OutcomeState {
    OutcomeState::from_raw(self.shared.state.load(Ordering::Acquire))
  }

  pub fn is_cancelled(&self) -> bool {
    self.state() == OutcomeState::Cancelled
  }

  pub fn is_done(&self) -> bool {
    self.state().is_terminal()
  }

  /// The last phase the upgrade process entered
  pub fn phase(&self) -> Phase {
    Phase::from_raw(self.shared.phase.load(Ordering::Acquire))
  }

  pub(crate) fn set_phase(&self, phase: Phase) {
    self.shared.phase.store(phase as u8, Ordering::Release);
  }

  /// Resolves as succeeded; on losing, returns the state that won
  pub(crate) fn succeed(&self, session: Session) -> Result<(), OutcomeState> {
    let res = self.shared.resolve(Ok(session));
    if res.is_ok() {
      tracing::debug!("connect_outcome_succeeded");
    }
    res
  }

  /// Resolves as failed; on losing, returns the state that won
  pub(crate) fn fail(&self, error: ConnectError) -> Result<(), OutcomeState> {
    self.shared.fail(error)
  }

  /// The stored failure if failed, `Cancelled` if cancelled
  pub(crate) fn error(&self) -> Option<ConnectError> {
    match self.try_get() {
      Some(Err(error)) => Some(error),
      _ => None,
    }
  }

  /// Fires once cancelled with `may_interrupt`
  pub(crate) fn interrupt_listener(&self) -> CancellationListener {
    CancellationListener::from(self.shared.interrupt.clone())
  }

  pub(crate) fn downgrade(&self) -> WeakOutcome {
    WeakOutcome {
      shared: Arc::downgrade(&self.shared),
    }
  }
}

impl std::fmt::Debug for ConnectOutcome {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectOutcome")
      .field("state", &self.state())
      .field("phase", &self.phase())
      .finish()
  }
}

/// A non-owning link from a session back to the outcome that created it
#[derive(Clone, Debug)]
pub(crate) struct WeakOutcome {
  shared: Weak<Shared>,
}

impl WeakOutcome {
  /// Fails the outcome if it is still alive and pending
  pub(crate) fn fail(&self, error: ConnectError) -> bool {
    match self.shared.upgrade() {
      Some(shared) => shared.fail(error).is_ok(),
      None => false,
    }
  }
}
