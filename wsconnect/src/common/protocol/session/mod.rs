// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A single logical websocket connection, from creation through closure
//!
//! Sessions are created once the upgrade response validates, attached to the
//! websocket transport at the protocol switch, and only begin reading frames
//! once the connect outcome has been resolved.

use std::sync::{
  atomic::{AtomicBool, AtomicU8, Ordering},
  Arc, Mutex, OnceLock, PoisonError,
};

use futures::{
  stream::{SplitSink, SplitStream},
  SinkExt, StreamExt,
};
use tokio_tungstenite::{
  tungstenite::{
    self,
    protocol::{frame::coding::CloseCode, CloseFrame},
  },
  WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{
  endpoint::EndpointDispatcher,
  handshake::{UpgradeRequest, UpgradeResponse},
  outcome::WeakOutcome,
  ConnectError,
};
use crate::util::WrappedStream;

pub mod id;

pub use id::{SequentialSessionIds, SessionId, SessionIdGenerator};

pub use tungstenite::Message;

type WsStream = WebSocketStream<WrappedStream>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Close status used when the transport ends without a close handshake
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close status reported when the peer's close frame carried no status
pub const NO_STATUS_RECEIVED: u16 = 1005;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
  Created = 0,
  Open = 1,
  Closing = 2,
  Closed = 3,
}

impl SessionState {
  fn from_raw(raw: u8) -> Self {
    match raw {
      0 => Self::Created,
      1 => Self::Open,
      2 => Self::Closing,
      _ => Self::Closed,
    }
  }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum SessionError {
  #[error("Session has not been opened")]
  NotOpen,
  #[error("Session is closed")]
  Closed,
  #[error("Websocket transport failure: {0}")]
  Transport(#[source] Arc<tungstenite::Error>),
}

impl From<tungstenite::Error> for SessionError {
  fn from(e: tungstenite::Error) -> Self {
    match e {
      tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => Self::Closed,
      other => Self::Transport(Arc::new(other)),
    }
  }
}

struct SessionInner {
  id: SessionId,
  request: UpgradeRequest,
  response: UpgradeResponse,
  state: AtomicU8,
  dispatcher: Arc<EndpointDispatcher>,
  sink: tokio::sync::Mutex<Option<WsSink>>,
  source: Mutex<Option<WsSource>>,
  outcome: OnceLock<WeakOutcome>,
  released: AtomicBool,
  shutdown: CancellationToken,
}

/// Handle to a websocket session; clones refer to the same session
#[derive(Clone)]
pub struct Session {
  inner: Arc<SessionInner>,
}

impl Session {
  pub(crate) fn new(
    id: SessionId,
    request: UpgradeRequest,
    response: UpgradeResponse,
    dispatcher: Arc<EndpointDispatcher>,
  ) -> Self {
    Self {
      inner: Arc::new(SessionInner {
        id,
        request,
        response,
        state: AtomicU8::new(SessionState::Created as u8),
        dispatcher,
        sink: tokio::sync::Mutex::new(None),
        source: Mutex::new(None),
        outcome: OnceLock::new(),
        released: AtomicBool::new(false),
        shutdown: CancellationToken::new(),
      }),
    }
  }

  pub fn id(&self) -> SessionId {
    self.inner.id
  }

  /// The handshake request as sent, including hook amendments
  pub fn request(&self) -> &UpgradeRequest {
    &self.inner.request
  }

  pub fn response(&self) -> &UpgradeResponse {
    &self.inner.response
  }

  pub fn subprotocol(&self) -> Option<&str> {
    self.inner.response.accepted_subprotocol()
  }

  pub fn state(&self) -> SessionState {
    SessionState::from_raw(self.inner.state.load(Ordering::Acquire))
  }

  pub fn is_open(&self) -> bool {
    self.state() == SessionState::Open
  }

  pub async fn send(&self, message: Message) -> Result<(), SessionError> {
    match self.state() {
      SessionState::Created => return Err(SessionError::NotOpen),
      SessionState::Closing | SessionState::Closed => return Err(SessionError::Closed),
      SessionState::Open => (),
    }
    let mut sink = self.inner.sink.lock().await;
    let sink = sink.as_mut().ok_or(SessionError::Closed)?;
    sink.send(message).await?;
    Ok(())
  }

  pub async fn send_text<T: Into<String>>(&self, text: T) -> Result<(), SessionError> {
    self.send(Message::Text(text.into())).await
  }

  pub async fn send_binary<T: Into<Vec<u8>>>(&self, data: T) -> Result<(), SessionError> {
    self.send(Message::Binary(data.into())).await
  }

  pub async fn ping<T: Into<Vec<u8>>>(&self, payload: T) -> Result<(), SessionError> {
    self.send(Message::Ping(payload.into())).await
  }

  /// Begins the closing handshake
  ///
  /// Closing a session whose connect is still pending fails that connect with
  /// [ConnectError::SessionClosed]. Closing an already-closing session is a no-op.
  pub async fn close(&self, code: u16, reason: &str) -> Result<(), SessionError> {
    let previous = self.begin_close();
    tracing::debug!(session_id = ?self.id(), code, ?previous, "session_close_requested");
    match previous {
      SessionState::Closing | SessionState::Closed => return Ok(()),
      SessionState::Created => {
        // Never switched protocols; there is no handshake to negotiate
        self.fail_outcome(ConnectError::SessionClosed);
        self.inner.state.store(SessionState::Closed as u8, Ordering::Release);
        self.release_transport().await;
        return Ok(());
      }
      SessionState::Open => (),
    }
    self.fail_outcome(ConnectError::SessionClosed);
    let frame = CloseFrame {
      code: CloseCode::from(code),
      reason: reason.to_owned().into(),
    };
    let mut sink = self.inner.sink.lock().await;
    let sink = sink.as_mut().ok_or(SessionError::Closed)?;
    sink.send(Message::Close(Some(frame))).await?;
    Ok(())
  }

  fn begin_close(&self) -> SessionState {
    let mut current = self.inner.state.load(Ordering::Acquire);
    loop {
      let state = SessionState::from_raw(current);
      if matches!(state, SessionState::Closing | SessionState::Closed) {
        return state;
      }
      match self.inner.state.compare_exchange(
        current,
        SessionState::Closing as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return state,
        Err(actual) => current = actual,
      }
    }
  }

  fn fail_outcome(&self, error: ConnectError) {
    if let Some(outcome) = self.inner.outcome.get() {
      outcome.fail(error);
    }
  }

  pub(crate) fn link_outcome(&self, outcome: WeakOutcome) {
    if self.inner.outcome.set(outcome).is_err() {
      tracing::warn!(session_id = ?self.id(), "session_outcome_already_linked");
    }
  }

  /// Hands the upgraded transport to the session
  ///
  /// Returns `false`, dropping the transport, if the session closed first.
  pub(crate) async fn attach(&self, stream: WsStream) -> bool {
    // Held across the transition so a sender that sees `Open` also sees the sink
    let mut sink = self.inner.sink.lock().await;
    let opened = self
      .inner
      .state
      .compare_exchange(
        SessionState::Created as u8,
        SessionState::Open as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_ok();
    if !opened {
      drop(stream);
      tracing::debug!(session_id = ?self.id(), state = ?self.state(), "session_transport_discarded");
      return false;
    }
    let (tx, rx) = stream.split();
    *self.inner.source.lock().unwrap_or_else(PoisonError::into_inner) = Some(rx);
    *sink = Some(tx);
    true
  }

  /// Starts delivering inbound frames to the endpoint
  pub(crate) fn start_io(&self) {
    let source = self
      .inner
      .source
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    let source = match source {
      Some(source) => source,
      None => {
        tracing::trace!(session_id = ?self.id(), "session_io_not_started");
        return;
      }
    };
    let span = tracing::debug_span!("session_reader", session_id = ?self.id());
    tokio::spawn(self.clone().read_frames(source).instrument(span));
  }

  async fn read_frames(self, mut source: WsSource) {
    let shutdown = self.inner.shutdown.clone();
    let (code, reason) = loop {
      let next = tokio::select! {
        _ = shutdown.cancelled() => {
          tracing::trace!("session_reader_shutdown");
          return;
        }
        next = source.next() => next,
      };
      match next {
        Some(Ok(Message::Close(frame))) => {
          let (code, reason) = frame
            .map(|frame| (u16::from(frame.code), frame.reason.into_owned()))
            .unwrap_or((NO_STATUS_RECEIVED, String::new()));
          if self.begin_close() == SessionState::Open {
            // Peer-initiated; flush the queued close reply before releasing
            if let Some(sink) = self.inner.sink.lock().await.as_mut() {
              let _ = sink.flush().await;
            }
          }
          break (code, reason);
        }
        Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
          self.inner.dispatcher.message(&self, message);
        }
        Some(Ok(_control)) => (),
        Some(Err(error)) => {
          tracing::debug!(error = %error, "session_transport_failed");
          break (ABNORMAL_CLOSURE, error.to_string());
        }
        None => break (ABNORMAL_CLOSURE, String::new()),
      }
    };
    drop(source);
    self.finish_close(code, &reason).await;
  }

  async fn finish_close(&self, code: u16, reason: &str) {
    self.inner.state.store(SessionState::Closed as u8, Ordering::Release);
    self.release_transport().await;
    self.fail_outcome(ConnectError::SessionClosed);
    tracing::debug!(session_id = ?self.id(), code, "session_closed");
    self.inner.dispatcher.close(code, reason);
  }

  /// Closes the transport without a close handshake; returns `true` only for the releasing call
  pub(crate) async fn release_transport(&self) -> bool {
    if self.inner.released.swap(true, Ordering::AcqRel) {
      return false;
    }
    self.inner.shutdown.cancel();
    let source = self
      .inner
      .source
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    drop(source);
    let sink = self.inner.sink.lock().await.take();
    drop(sink);
    tracing::trace!(session_id = ?self.id(), "session_transport_released");
    true
  }

  /// Tears the session down and reports `error` as its terminal notification
  pub(crate) async fn abort(&self, error: ConnectError) {
    self.inner.state.store(SessionState::Closed as u8, Ordering::Release);
    self.release_transport().await;
    self.inner.dispatcher.error(&error);
  }

  #[cfg(test)]
  pub(crate) fn detached_for_test() -> Self {
    use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};

    struct Silent;
    impl super::endpoint::Endpoint for Silent {
      fn on_connect(&self, _session: &Session) {}
      fn on_error(&self, _error: &ConnectError) {}
      fn on_close(&self, _code: u16, _reason: &str) {}
    }

    static IDS: OnceLock<SequentialSessionIds> = OnceLock::new();
    Self::new(
      IDS.get_or_init(Default::default).next(),
      UpgradeRequest::new("ws://localhost/".parse().expect("Static URI must parse")),
      UpgradeResponse::new(StatusCode::SWITCHING_PROTOCOLS, HeaderMap::new()),
      Arc::new(EndpointDispatcher::new(Arc::new(Silent))),
    )
  }
}

impl std::fmt::Debug for Session {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Session")
      .field("id", &self.id())
      .field("state", &self.state())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use futures::{SinkExt, StreamExt};
  use tokio_tungstenite::{
    tungstenite::{protocol::Role, Message},
    WebSocketStream,
  };

  use super::{Session, SessionError, SessionState};
  use crate::{
    common::protocol::{outcome::ConnectOutcome, ConnectError},
    util::WrappedStream,
  };

  async fn attached_pair() -> (Session, WebSocketStream<WrappedStream>) {
    let (near, far) = WrappedStream::duplex(4096);
    let session = Session::detached_for_test();
    let client = WebSocketStream::from_raw_socket(near, Role::Client, None).await;
    let server = WebSocketStream::from_raw_socket(far, Role::Server, None).await;
    assert!(session.attach(client).await);
    (session, server)
  }

  #[tokio::test]
  async fn sends_require_open_session() {
    let session = Session::detached_for_test();
    assert!(matches!(
      session.send_text("early").await,
      Err(SessionError::NotOpen)
    ));
  }

  #[tokio::test]
  async fn closing_before_open_fails_linked_outcome() {
    let outcome = ConnectOutcome::new();
    let session = Session::detached_for_test();
    session.link_outcome(outcome.downgrade());
    session.close(1000, "").await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(
      outcome.get(Some(Duration::from_secs(1))).await,
      Err(ConnectError::SessionClosed)
    ));
    // Idempotent
    session.close(1000, "").await.unwrap();
  }

  #[tokio::test]
  async fn transport_attached_after_close_is_dropped() {
    let (near, far) = WrappedStream::duplex(4096);
    let session = Session::detached_for_test();
    session.close(1000, "").await.unwrap();
    let client = WebSocketStream::from_raw_socket(near, Role::Client, None).await;
    let mut server = WebSocketStream::from_raw_socket(far, Role::Server, None).await;
    assert!(!session.attach(client).await);
    assert_eq!(session.state(), SessionState::Closed);
    let peer_saw_hangup = tokio::time::timeout(Duration::from_secs(1), server.next())
      .await
      .expect("Discarded transport must be closed while the session lives");
    assert!(matches!(peer_saw_hangup, None | Some(Err(_))));
    assert!(matches!(
      session.send_text("after").await,
      Err(SessionError::Closed)
    ));
  }

  #[tokio::test]
  async fn sends_reach_the_peer_and_close_completes() {
    let fut = async move {
      let (session, mut server) = attached_pair().await;
      session.start_io();
      session.send_text("hello").await.unwrap();
      session.send_binary(vec![1u8, 2, 3]).await.unwrap();
      assert_eq!(
        server.next().await.unwrap().unwrap(),
        Message::Text("hello".into())
      );
      assert_eq!(
        server.next().await.unwrap().unwrap(),
        Message::Binary(vec![1, 2, 3])
      );
      session.close(1000, "done").await.unwrap();
      assert_eq!(session.state(), SessionState::Closing);
      assert!(matches!(server.next().await, Some(Ok(Message::Close(_)))));
      // The server's reply is flushed while draining
      assert!(server.next().await.is_none());
      while session.state() != SessionState::Closed {
        tokio::task::yield_now().await;
      }
      assert!(matches!(
        session.send_text("late").await,
        Err(SessionError::Closed)
      ));
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("Session close test may be failing due to an await deadlock");
  }

  #[tokio::test]
  async fn released_transport_is_released_once() {
    let (session, mut server) = attached_pair().await;
    assert!(session.release_transport().await);
    assert!(!session.release_transport().await);
    let _ = server.send(Message::Text("unheard".into())).await;
    assert!(matches!(server.next().await, None | Some(Err(_))));
  }
}
