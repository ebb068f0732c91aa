// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A [CancellationToken] that cannot be triggered by its recipient
///
/// The connect outcome keeps the triggering side; the upgrade process only
/// receives a listener, so it can react to an interrupting cancel but never
/// issue one.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}
