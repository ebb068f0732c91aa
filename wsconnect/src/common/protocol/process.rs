// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The upgrade state machine driving one connect attempt
//!
//! Cancellation is cooperative. A cancel never interrupts an in-flight network
//! operation or a running hook; instead the process inspects its outcome at
//! fixed checkpoints and stops there. Cancellation noticed right after a
//! network operation surfaces to the endpoint as an abandoned handshake;
//! cancellation noticed after client-side processing surfaces as `Cancelled`.

use std::sync::Arc;

use tokio_tungstenite::{tungstenite::protocol::Role, WebSocketStream};

use super::{
  endpoint::EndpointDispatcher,
  handshake::{HandshakeCodec, ReceivedResponse, UpgradeRequest},
  hooks::{notify_session_created, SessionListener, UpgradeListener},
  outcome::{ConnectOutcome, OutcomeState},
  session::{Session, SessionId, SessionState},
  ConnectError, UpgradeError,
};
use crate::{
  common::{
    config::ClientConfig,
    transport::{Dialer, Target},
  },
  util::{dropkick::Dropkick, WrappedStream},
};

/// Stages of an upgrade, in the order they are entered
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
  Dialing = 0,
  RequestSent = 1,
  ResponseAwaited = 2,
  SessionCreated = 3,
  ResponseObserved = 4,
  Upgrading = 5,
  Opening = 6,
  Open = 7,
}

impl Phase {
  pub(crate) fn from_raw(raw: u8) -> Self {
    match raw {
      0 => Self::Dialing,
      1 => Self::RequestSent,
      2 => Self::ResponseAwaited,
      3 => Self::SessionCreated,
      4 => Self::ResponseObserved,
      5 => Self::Upgrading,
      6 => Self::Opening,
      _ => Self::Open,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Checkpoint {
  AfterNetwork,
  AfterClient,
}

/// Why the process stopped before opening
#[derive(Debug)]
enum Interruption {
  /// This attempt failed; the outcome is resolved with the error
  Failed(ConnectError),
  /// The outcome was already resolved elsewhere; only the endpoint hears of it
  Superseded(ConnectError),
}

impl From<UpgradeError> for Interruption {
  fn from(e: UpgradeError) -> Self {
    Self::Failed(ConnectError::Upgrade(e))
  }
}

impl From<ConnectError> for Interruption {
  fn from(e: ConnectError) -> Self {
    Self::Failed(e)
  }
}

pub(crate) struct UpgradeProcess {
  pub(crate) session_id: SessionId,
  pub(crate) outcome: ConnectOutcome,
  pub(crate) dispatcher: Arc<EndpointDispatcher>,
  pub(crate) request: UpgradeRequest,
  pub(crate) listener: Option<Arc<dyn UpgradeListener>>,
  pub(crate) session_listeners: Vec<Arc<dyn SessionListener>>,
  pub(crate) dialer: Arc<dyn Dialer>,
  pub(crate) codec: Arc<dyn HandshakeCodec>,
  pub(crate) config: Arc<ClientConfig>,
}

impl UpgradeProcess {
  pub(crate) async fn run(self) {
    // Dropping the task mid-upgrade (runtime shutdown, panicking hook) must still resolve the outcome
    let abandoned = Dropkick::callback({
      let outcome = self.outcome.clone();
      let dispatcher = self.dispatcher.clone();
      move || {
        if outcome.fail(ConnectError::Aborted).is_ok() {
          tracing::warn!("upgrade_task_dropped");
          dispatcher.error(&ConnectError::Aborted);
        }
      }
    });
    match self.drive().await {
      Ok(()) => (),
      Err(Interruption::Failed(error)) => {
        tracing::debug!(phase = ?self.outcome.phase(), error = %error, "upgrade_failed");
        if self.outcome.fail(error.clone()).is_ok() {
          self.dispatcher.error(&error);
        } else if let Some(superseding) = self.superseding_error(Checkpoint::AfterClient) {
          self.dispatcher.error(&superseding);
        }
      }
      Err(Interruption::Superseded(error)) => {
        tracing::debug!(phase = ?self.outcome.phase(), error = %error, "upgrade_stopped");
        self.dispatcher.error(&error);
      }
    }
    abandoned.counter();
  }

  fn enter(&self, phase: Phase) {
    tracing::trace!(?phase, "upgrade_phase");
    self.outcome.set_phase(phase);
  }

  /// The error the endpoint should see if the outcome is no longer pending
  fn superseding_error(&self, checkpoint: Checkpoint) -> Option<ConnectError> {
    match self.outcome.state() {
      OutcomeState::Pending => None,
      OutcomeState::Cancelled if checkpoint == Checkpoint::AfterNetwork => {
        Some(UpgradeError::Abandoned.into())
      }
      OutcomeState::Cancelled => Some(ConnectError::Cancelled),
      OutcomeState::Succeeded | OutcomeState::Failed => Some(
        self
          .outcome
          .error()
          .unwrap_or(ConnectError::SessionClosed),
      ),
    }
  }

  fn checkpoint(&self, checkpoint: Checkpoint) -> Result<(), Interruption> {
    match self.superseding_error(checkpoint) {
      None => Ok(()),
      Some(error) => Err(Interruption::Superseded(error)),
    }
  }

  async fn dial(&self, target: &Target) -> Result<WrappedStream, ConnectError> {
    let dial = self.dialer.dial(target);
    let res = match self.config.connect_timeout() {
      Some(timeout) => match tokio::time::timeout(timeout, dial).await {
        Ok(res) => res,
        Err(_elapsed) => Err(std::io::Error::new(
          std::io::ErrorKind::TimedOut,
          format!("Connecting to {} timed out", target),
        )),
      },
      None => dial.await,
    };
    res.map_err(ConnectError::dial)
  }

  async fn receive_response(
    &self,
    channel: &mut WrappedStream,
  ) -> Result<ReceivedResponse, UpgradeError> {
    let receive = self.codec.receive_response(channel);
    match self.config.handshake_timeout() {
      Some(timeout) => match tokio::time::timeout(timeout, receive).await {
        Ok(res) => res,
        Err(_elapsed) => Err(
          std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "Timed out awaiting the upgrade response",
          )
          .into(),
        ),
      },
      None => receive.await,
    }
  }

  async fn drive(&self) -> Result<(), Interruption> {
    let target = Target::from_uri(self.request.uri())?;

    self.enter(Phase::Dialing);
    let mut channel = self.dial(&target).await?;
    self.checkpoint(Checkpoint::AfterNetwork)?;

    self.enter(Phase::RequestSent);
    let mut request = self.request.clone();
    if let Some(listener) = &self.listener {
      listener
        .on_handshake_request(&mut request)
        .map_err(UpgradeError::hook)?;
    }
    self.codec.send_request(&mut channel, &request).await?;

    self.enter(Phase::ResponseAwaited);
    let received = self.receive_response(&mut channel).await;
    // A response arriving after cancellation is discarded whatever it says
    self.checkpoint(Checkpoint::AfterNetwork)?;
    let ReceivedResponse {
      response,
      remainder,
    } = received?;
    self.codec.validate(&request, &response)?;

    let session = Session::new(self.session_id, request, response, self.dispatcher.clone());
    self.enter(Phase::SessionCreated);
    notify_session_created(&self.session_listeners, &session).map_err(UpgradeError::hook)?;
    self.checkpoint(Checkpoint::AfterClient)?;

    session.link_outcome(self.outcome.downgrade());
    if session.state() != SessionState::Created {
      // Closed by a session listener before the link existed
      return Err(Interruption::Failed(ConnectError::SessionClosed));
    }
    self.enter(Phase::ResponseObserved);
    if let Some(listener) = &self.listener {
      listener
        .on_handshake_response(session.response())
        .map_err(UpgradeError::hook)?;
    }
    self.checkpoint(Checkpoint::AfterClient)?;

    self.enter(Phase::Upgrading);
    let stream = WebSocketStream::from_partially_read(
      channel,
      remainder,
      Role::Client,
      Some(self.config.websocket_config()),
    )
    .await;
    if !session.attach(stream).await {
      return Err(Interruption::Failed(ConnectError::SessionClosed));
    }
    if let Err(interruption) = self.checkpoint(Checkpoint::AfterClient) {
      session.release_transport().await;
      return Err(interruption);
    }

    self.enter(Phase::Opening);
    let returned = self.watch_for_interrupt(&session);
    self.dispatcher.open(&session);
    returned.kick();

    match self.outcome.succeed(session.clone()) {
      Ok(()) => {
        tracing::trace!(phase = ?Phase::Open, "upgrade_phase");
        session.start_io();
      }
      Err(OutcomeState::Cancelled) => {
        tracing::debug!(session_id = ?session.id(), "cancelled_while_opening");
        session.abort(ConnectError::Cancelled).await;
      }
      Err(state) => {
        // The endpoint closed its own session during `on_connect`; let the close handshake finish
        tracing::debug!(session_id = ?session.id(), ?state, "closed_while_opening");
        session.start_io();
      }
    }
    Ok(())
  }

  /// Tears the transport down if an interrupting cancel lands while `on_connect` runs
  ///
  /// Kicking the returned guard signals that `on_connect` has returned.
  fn watch_for_interrupt(&self, session: &Session) -> Dropkick<tokio::sync::oneshot::Sender<()>> {
    let (returned, on_returned) = tokio::sync::oneshot::channel::<()>();
    let interrupt = self.outcome.interrupt_listener();
    let session = session.clone();
    tokio::spawn(async move {
      tokio::select! {
        _ = interrupt.cancelled() => {
          if session.release_transport().await {
            tracing::debug!(session_id = ?session.id(), "transport_interrupted_during_open");
          }
        }
        _ = on_returned => (),
      }
    });
    Dropkick::new(returned)
  }
}
