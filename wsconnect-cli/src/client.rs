// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{sync::Arc, time::Duration};

use anyhow::{Context as AnyhowContext, Result};
use tokio::sync::mpsc;
use wsconnect::{
  ClientConfig, ConnectError, Endpoint, Message, Session, UpgradeClient, UpgradeRequest, Uri,
};

const REPLY_PATIENCE: Duration = Duration::from_secs(5);
const NORMAL_CLOSURE: u16 = 1000;

#[derive(Clone, Debug)]
pub struct ConnectArgs {
  pub target: Uri,
  pub messages: Vec<String>,
  pub timeout: Option<Duration>,
  pub cancel_after: Option<Duration>,
  pub subprotocols: Vec<String>,
  pub config: ClientConfig,
}

#[derive(Debug)]
enum EndpointEvent {
  Message(Message),
  Error(ConnectError),
  Closed(u16, String),
}

/// Logs lifecycle notifications and forwards them to the driving task
struct LoggingEndpoint {
  events: mpsc::UnboundedSender<EndpointEvent>,
}

impl Endpoint for LoggingEndpoint {
  fn on_connect(&self, session: &Session) {
    tracing::info!(
      session_id = ?session.id(),
      subprotocol = ?session.subprotocol(),
      "connected"
    );
  }

  fn on_message(&self, _session: &Session, message: Message) {
    let _ = self.events.send(EndpointEvent::Message(message));
  }

  fn on_error(&self, error: &ConnectError) {
    tracing::warn!(error = %error, handshake = error.is_handshake_level(), "connection_error");
    let _ = self.events.send(EndpointEvent::Error(error.clone()));
  }

  fn on_close(&self, code: u16, reason: &str) {
    tracing::info!(code, reason, "connection_closed");
    let _ = self
      .events
      .send(EndpointEvent::Closed(code, reason.to_owned()));
  }
}

async fn next_event(
  events: &mut mpsc::UnboundedReceiver<EndpointEvent>,
) -> Result<Option<EndpointEvent>> {
  match tokio::time::timeout(REPLY_PATIENCE, events.recv()).await {
    Ok(event) => Ok(event),
    Err(_elapsed) => {
      tracing::warn!(patience = ?REPLY_PATIENCE, "no_event_before_deadline");
      Ok(None)
    }
  }
}

#[tracing::instrument(skip_all, fields(target = %args.target), err)]
pub async fn connect_main(args: ConnectArgs) -> Result<()> {
  let client = UpgradeClient::new(args.config);
  let (events_tx, mut events) = mpsc::unbounded_channel();
  let endpoint = Arc::new(LoggingEndpoint { events: events_tx });

  let mut request = UpgradeRequest::new(args.target.clone());
  for protocol in &args.subprotocols {
    request.add_subprotocol(protocol.clone());
  }
  let outcome = client.connect_with(endpoint, request, None);

  if let Some(delay) = args.cancel_after {
    let outcome = outcome.clone();
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let cancelled = outcome.cancel(true);
      tracing::info!(cancelled, phase = ?outcome.phase(), "cancel_after_elapsed");
    });
  }

  let session = outcome
    .get(args.timeout)
    .await
    .context("Connecting to target")?;

  for message in args.messages {
    session
      .send_text(message)
      .await
      .context("Sending message")?;
    match next_event(&mut events).await? {
      Some(EndpointEvent::Message(reply)) => tracing::info!(reply = ?reply, "received"),
      Some(EndpointEvent::Closed(code, reason)) => {
        anyhow::bail!("Session closed by peer ({}): {}", code, reason)
      }
      Some(EndpointEvent::Error(error)) => {
        return Err(error).context("Session failed while awaiting a reply")
      }
      None => (),
    }
  }

  session
    .close(NORMAL_CLOSURE, "")
    .await
    .context("Closing session")?;
  loop {
    match next_event(&mut events).await? {
      Some(EndpointEvent::Closed(code, _)) => {
        tracing::debug!(code, "close_handshake_complete");
        break;
      }
      Some(EndpointEvent::Error(error)) => {
        return Err(error).context("Session failed while closing")
      }
      Some(EndpointEvent::Message(late)) => tracing::debug!(message = ?late, "late_message"),
      None => break,
    }
  }
  Ok(())
}
