// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The entry point for opening client websocket connections

use std::sync::{Arc, PoisonError, RwLock};

use tokio_tungstenite::tungstenite::http::Uri;
use tracing::Instrument;

use crate::common::{
  config::ClientConfig,
  protocol::{
    endpoint::{Endpoint, EndpointDispatcher},
    handshake::{HandshakeCodec, Http11Codec, UpgradeRequest},
    hooks::{SessionListener, UpgradeListener},
    outcome::ConnectOutcome,
    process::UpgradeProcess,
    session::{SequentialSessionIds, SessionIdGenerator},
  },
  transport::{Dialer, TcpDialer},
};

/// Opens websocket sessions, each driven on its own task
///
/// Must be used from within a tokio runtime.
pub struct UpgradeClient {
  config: Arc<ClientConfig>,
  dialer: Arc<dyn Dialer>,
  codec: Arc<dyn HandshakeCodec>,
  session_listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
  session_ids: Arc<dyn SessionIdGenerator>,
}

impl UpgradeClient {
  pub fn new(config: ClientConfig) -> Self {
    let codec = Http11Codec::new(config.max_handshake_size, config.user_agent.clone());
    Self {
      config: Arc::new(config),
      dialer: Arc::new(TcpDialer::new()),
      codec: Arc::new(codec),
      session_listeners: RwLock::new(Vec::new()),
      session_ids: Arc::new(SequentialSessionIds::default()),
    }
  }

  pub fn with_dialer<D: Dialer + 'static>(mut self, dialer: D) -> Self {
    self.dialer = Arc::new(dialer);
    self
  }

  pub fn with_codec<C: HandshakeCodec + 'static>(mut self, codec: C) -> Self {
    self.codec = Arc::new(codec);
    self
  }

  /// Replaces the source of session ids, e.g. to keep ids unique across several clients
  pub fn with_session_ids(mut self, ids: Arc<dyn SessionIdGenerator>) -> Self {
    self.session_ids = ids;
    self
  }

  pub fn config(&self) -> &ClientConfig {
    &self.config
  }

  /// Registers a listener notified of every session this client creates from now on
  pub fn add_session_listener<L: SessionListener + 'static>(&self, listener: L) {
    self
      .session_listeners
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .push(Arc::new(listener));
  }

  /// Connects to `target`, delivering the session to `endpoint`
  pub fn connect(&self, endpoint: Arc<dyn Endpoint>, target: Uri) -> ConnectOutcome {
    self.connect_with(endpoint, UpgradeRequest::new(target), None)
  }

  /// Connects with a prepared request and an optional handshake listener
  ///
  /// Returns immediately; the returned outcome is pending until the upgrade
  /// finishes, fails, or is cancelled.
  pub fn connect_with(
    &self,
    endpoint: Arc<dyn Endpoint>,
    request: UpgradeRequest,
    listener: Option<Arc<dyn UpgradeListener>>,
  ) -> ConnectOutcome {
    let outcome = ConnectOutcome::new();
    let session_id = self.session_ids.next();
    let span = tracing::debug_span!("upgrade", session_id = ?session_id, uri = %request.uri());
    let process = UpgradeProcess {
      session_id,
      outcome: outcome.clone(),
      dispatcher: Arc::new(EndpointDispatcher::new(endpoint)),
      request,
      listener,
      session_listeners: self
        .session_listeners
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone(),
      dialer: self.dialer.clone(),
      codec: self.codec.clone(),
      config: self.config.clone(),
    };
    tokio::spawn(process.run().instrument(span));
    outcome
  }
}

impl Default for UpgradeClient {
  fn default() -> Self {
    Self::new(ClientConfig::default())
  }
}

impl std::fmt::Debug for UpgradeClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("UpgradeClient")
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::{
      atomic::{AtomicUsize, Ordering},
      Arc,
    },
    time::Duration,
  };

  use super::UpgradeClient;
  use crate::common::{
    config::ClientConfig,
    protocol::{
      session::{SequentialSessionIds, Session, SessionId, SessionIdGenerator},
      ConnectError, Endpoint, OutcomeState,
    },
    transport::{self, Target},
  };

  struct Quiet;

  impl Endpoint for Quiet {
    fn on_connect(&self, _session: &Session) {}
    fn on_error(&self, _error: &ConnectError) {}
    fn on_close(&self, _code: u16, _reason: &str) {}
  }

  #[tokio::test]
  async fn invalid_targets_fail_without_dialing() {
    let (dialer, mut listener) = transport::duplex::channel();
    let client = UpgradeClient::new(ClientConfig::default()).with_dialer(dialer);
    let outcome = client.connect(Arc::new(Quiet), "wss://secure.test/".parse().unwrap());
    assert!(matches!(
      outcome.get(Some(Duration::from_secs(5))).await,
      Err(ConnectError::InvalidTarget(_))
    ));
    assert_eq!(outcome.state(), OutcomeState::Failed);
    drop(client);
    assert!(listener.accept().await.is_none());
  }

  #[tokio::test]
  async fn dials_through_configured_dialer() {
    let (dialer, mut listener) = transport::duplex::channel();
    let client = UpgradeClient::new(ClientConfig::default()).with_dialer(dialer);
    let outcome = client.connect(Arc::new(Quiet), "ws://memory.test:8080/".parse().unwrap());
    let (target, far) = listener.accept().await.expect("Client must dial");
    assert_eq!(target, Target::new("memory.test", 8080));
    // Hanging up without answering the handshake fails the attempt
    drop(far);
    let res = outcome.get(Some(Duration::from_secs(5))).await;
    assert!(res.unwrap_err().is_handshake_level());
  }

  struct CountingIds {
    issued: AtomicUsize,
    inner: SequentialSessionIds,
  }

  impl SessionIdGenerator for CountingIds {
    fn next(&self) -> SessionId {
      self.issued.fetch_add(1, Ordering::SeqCst);
      self.inner.next()
    }
  }

  #[tokio::test]
  async fn shared_id_source_is_drawn_once_per_connect() {
    let ids = Arc::new(CountingIds {
      issued: AtomicUsize::new(0),
      inner: SequentialSessionIds::starting_at(100),
    });
    let (dialer, _listener) = transport::duplex::channel();
    let client = UpgradeClient::new(ClientConfig::default())
      .with_dialer(dialer)
      .with_session_ids(ids.clone());
    for _ in 0..3 {
      let outcome = client.connect(Arc::new(Quiet), "wss://secure.test/".parse().unwrap());
      assert!(outcome.get(Some(Duration::from_secs(5))).await.is_err());
    }
    assert_eq!(ids.issued.load(Ordering::SeqCst), 3);
    assert_eq!(ids.inner.next(), SessionId::new(103));
  }
}
