// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

/// Error type raised by caller-supplied hooks
pub type HookError = anyhow::Error;

/// Handshake-level failures: anything that goes wrong between dialing and the protocol switch
#[derive(thiserror::Error, Debug, Clone)]
pub enum UpgradeError {
  #[error("Upgrade rejected by server with status {status}")]
  Rejected {
    status: u16,
    reason: Option<Arc<String>>,
  },
  #[error("Upgrade handshake violated the protocol: {0}")]
  ProtocolViolation(Arc<String>),
  #[error("Transport failure during handshake: {0}")]
  Transport(
    #[from]
    #[source]
    Arc<std::io::Error>,
  ),
  #[error("Upgrade hook failed: {0}")]
  Hook(Arc<HookError>),
  #[error("Handshake abandoned after the connect attempt was cancelled")]
  Abandoned,
}

impl UpgradeError {
  pub fn protocol_violation<T: Into<String>>(message: T) -> Self {
    Self::ProtocolViolation(Arc::new(message.into()))
  }

  pub fn hook(error: HookError) -> Self {
    Self::Hook(Arc::new(error))
  }

  /// Returns `true` if the upgrade error is [`Abandoned`].
  ///
  /// [`Abandoned`]: UpgradeError::Abandoned
  #[must_use]
  pub fn is_abandoned(&self) -> bool {
    matches!(self, Self::Abandoned)
  }
}

impl From<std::io::Error> for UpgradeError {
  fn from(e: std::io::Error) -> Self {
    Self::Transport(Arc::new(e))
  }
}

/// The single error type crossing the connect boundary
///
/// Cloneable, as the one stored failure of an outcome is handed to every waiter.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ConnectError {
  #[error("Invalid connect target: {0}")]
  InvalidTarget(Arc<String>),
  #[error("Transport could not be established: {0}")]
  Dial(#[source] Arc<std::io::Error>),
  #[error(transparent)]
  Upgrade(#[from] UpgradeError),
  #[error("Connect attempt was cancelled")]
  Cancelled,
  #[error("Timed out waiting for the connect attempt")]
  TimedOut,
  #[error("Session closed before the connect attempt completed")]
  SessionClosed,
  #[error("Connect attempt was abandoned without resolution")]
  Aborted,
}

impl ConnectError {
  pub fn invalid_target<T: Into<String>>(message: T) -> Self {
    Self::InvalidTarget(Arc::new(message.into()))
  }

  pub fn dial(e: std::io::Error) -> Self {
    Self::Dial(Arc::new(e))
  }

  /// Returns `true` for the caller-initiated [`Cancelled`] error.
  ///
  /// [`Cancelled`]: ConnectError::Cancelled
  #[must_use]
  pub fn is_cancelled(&self) -> bool {
    matches!(self, Self::Cancelled)
  }

  /// Returns `true` for handshake-level failures, including transport failures
  #[must_use]
  pub fn is_handshake_level(&self) -> bool {
    matches!(self, Self::Upgrade(_) | Self::Dial(_))
  }
}

#[cfg(test)]
mod tests {
  use super::{ConnectError, UpgradeError};

  #[test]
  fn classification() {
    assert!(ConnectError::Cancelled.is_cancelled());
    assert!(!ConnectError::Cancelled.is_handshake_level());
    assert!(ConnectError::from(UpgradeError::Abandoned).is_handshake_level());
    assert!(ConnectError::dial(std::io::ErrorKind::ConnectionRefused.into()).is_handshake_level());
    assert!(!ConnectError::TimedOut.is_handshake_level());
  }

  #[test]
  fn upgrade_errors_display_through_connect_error() {
    let rejected = ConnectError::from(UpgradeError::Rejected {
      status: 404,
      reason: None,
    });
    assert_eq!(
      rejected.to_string(),
      "Upgrade rejected by server with status 404"
    );
    let hook = ConnectError::from(UpgradeError::hook(anyhow::anyhow!("nope")));
    assert_eq!(hook.to_string(), "Upgrade hook failed: nope");
  }
}
