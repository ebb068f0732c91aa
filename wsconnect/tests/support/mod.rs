// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![allow(dead_code)]

use std::{
  net::SocketAddr,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
  },
  time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpListener, sync::watch};
use tokio_tungstenite::tungstenite::{
  handshake::server::{ErrorResponse, Request, Response},
  http::{HeaderMap, StatusCode, Uri},
  Message,
};
use wsconnect::{ConnectError, Endpoint, Session};

pub const PATIENCE: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(100);

pub fn init_logging() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("wsconnect=trace")),
    )
    .with_test_writer()
    .try_init();
}

/// Blocks a synchronous callback until the test releases it
pub struct Latch {
  entered: tokio::sync::mpsc::UnboundedSender<()>,
  release: Mutex<std::sync::mpsc::Receiver<()>>,
}

pub struct LatchControl {
  entered: tokio::sync::mpsc::UnboundedReceiver<()>,
  release: std::sync::mpsc::Sender<()>,
}

pub fn latch() -> (Arc<Latch>, LatchControl) {
  let (entered_tx, entered_rx) = tokio::sync::mpsc::unbounded_channel();
  let (release_tx, release_rx) = std::sync::mpsc::channel();
  (
    Arc::new(Latch {
      entered: entered_tx,
      release: Mutex::new(release_rx),
    }),
    LatchControl {
      entered: entered_rx,
      release: release_tx,
    },
  )
}

impl Latch {
  /// Must be called from a multi-threaded runtime
  pub fn block(&self) {
    let _ = self.entered.send(());
    let release = self.release.lock().unwrap();
    let _ = tokio::task::block_in_place(|| release.recv_timeout(Duration::from_secs(30)));
  }
}

impl LatchControl {
  pub async fn entered(&mut self) {
    tokio::time::timeout(PATIENCE, self.entered.recv())
      .await
      .expect("Latched callback was never entered");
  }

  pub fn release(&self) {
    let _ = self.release.send(());
  }
}

#[derive(Clone, Default)]
pub struct ServerBehavior {
  /// Held while the server decides on its handshake response
  pub gate: Option<Arc<Latch>>,
  pub reject_with: Option<StatusCode>,
}

/// A loopback websocket server echoing text and binary messages
pub struct EchoServer {
  pub addr: SocketAddr,
  closed: watch::Receiver<usize>,
  requests: Arc<Mutex<Vec<HeaderMap>>>,
}

impl EchoServer {
  pub async fn start(behavior: ServerBehavior) -> Self {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed) = watch::channel(0usize);
    let closed_tx = Arc::new(closed_tx);
    let requests = Arc::new(Mutex::new(Vec::new()));
    let server_requests = requests.clone();
    tokio::spawn(async move {
      while let Ok((stream, _peer)) = listener.accept().await {
        let behavior = behavior.clone();
        let closed_tx = closed_tx.clone();
        let requests = server_requests.clone();
        tokio::spawn(async move {
          let respond = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            requests.lock().unwrap().push(request.headers().clone());
            if let Some(gate) = &behavior.gate {
              gate.block();
            }
            match behavior.reject_with {
              Some(status) => {
                let mut refusal = ErrorResponse::new(None);
                *refusal.status_mut() = status;
                Err(refusal)
              }
              None => Ok(response),
            }
          };
          if let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, respond).await {
            while let Some(Ok(message)) = ws.next().await {
              if matches!(message, Message::Text(_) | Message::Binary(_))
                && ws.send(message).await.is_err()
              {
                break;
              }
            }
          }
          closed_tx.send_modify(|count| *count += 1);
        });
      }
    });
    Self {
      addr,
      closed,
      requests,
    }
  }

  pub fn uri(&self, path: &str) -> Uri {
    format!("ws://{}{}", self.addr, path).parse().unwrap()
  }

  /// Waits until at least `count` server-side connections have ended
  pub async fn connections_closed(&self, count: usize) {
    let mut closed = self.closed.clone();
    tokio::time::timeout(PATIENCE, closed.wait_for(|closed| *closed >= count))
      .await
      .expect("Server connection was never closed")
      .expect("Server task ended");
  }

  pub fn closed_count(&self) -> usize {
    *self.closed.borrow()
  }

  pub fn request_headers(&self) -> Vec<HeaderMap> {
    self.requests.lock().unwrap().clone()
  }
}

/// An [Endpoint] recording every notification it receives
pub struct RecordingEndpoint {
  pub connects: AtomicUsize,
  errors: Mutex<Vec<ConnectError>>,
  closes: Mutex<Vec<(u16, String)>>,
  messages: Mutex<Vec<Message>>,
  session: Mutex<Option<Session>>,
  on_connect_gate: Option<Arc<Latch>>,
  events: watch::Sender<u64>,
}

impl Default for RecordingEndpoint {
  fn default() -> Self {
    Self {
      connects: AtomicUsize::new(0),
      errors: Mutex::new(Vec::new()),
      closes: Mutex::new(Vec::new()),
      messages: Mutex::new(Vec::new()),
      session: Mutex::new(None),
      on_connect_gate: None,
      events: watch::channel(0).0,
    }
  }
}

impl RecordingEndpoint {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn gated(gate: Arc<Latch>) -> Arc<Self> {
    Arc::new(Self {
      on_connect_gate: Some(gate),
      ..Default::default()
    })
  }

  pub fn connect_count(&self) -> usize {
    self.connects.load(Ordering::SeqCst)
  }

  pub fn errors(&self) -> Vec<ConnectError> {
    self.errors.lock().unwrap().clone()
  }

  pub fn closes(&self) -> Vec<(u16, String)> {
    self.closes.lock().unwrap().clone()
  }

  pub fn messages(&self) -> Vec<Message> {
    self.messages.lock().unwrap().clone()
  }

  pub fn session(&self) -> Option<Session> {
    self.session.lock().unwrap().clone()
  }

  pub fn terminal_count(&self) -> usize {
    self.errors.lock().unwrap().len() + self.closes.lock().unwrap().len()
  }

  /// Waits until `condition` holds, re-checking on every notification
  pub async fn wait_until<F: Fn(&Self) -> bool>(&self, condition: F) {
    let mut events = self.events.subscribe();
    let wait = async {
      loop {
        if condition(self) {
          return;
        }
        if events.changed().await.is_err() {
          return;
        }
      }
    };
    tokio::time::timeout(PATIENCE, wait)
      .await
      .expect("Endpoint never reached the expected state");
  }

  pub async fn terminated(&self) {
    self.wait_until(|endpoint| endpoint.terminal_count() > 0).await
  }

  /// Gives stray notifications time to arrive after the first terminal one
  pub async fn settled(&self) {
    self.terminated().await;
    tokio::time::sleep(SETTLE).await;
  }

  fn bump(&self) {
    self.events.send_modify(|count| *count += 1);
  }
}

impl Endpoint for RecordingEndpoint {
  fn on_connect(&self, session: &Session) {
    *self.session.lock().unwrap() = Some(session.clone());
    self.connects.fetch_add(1, Ordering::SeqCst);
    self.bump();
    if let Some(gate) = &self.on_connect_gate {
      gate.block();
    }
  }

  fn on_message(&self, _session: &Session, message: Message) {
    self.messages.lock().unwrap().push(message);
    self.bump();
  }

  fn on_error(&self, error: &ConnectError) {
    self.errors.lock().unwrap().push(error.clone());
    self.bump();
  }

  fn on_close(&self, code: u16, reason: &str) {
    self.closes.lock().unwrap().push((code, reason.to_owned()));
    self.bump();
  }
}
