// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Transport dialing: turning a [Target] into a live byte stream
//!
//! Dials are never cancelled mid-flight; the upgrade process decides after
//! completion whether to use or discard the resulting stream.

use futures::future::{BoxFuture, FutureExt};
use tokio_tungstenite::tungstenite::http::Uri;

use crate::{common::protocol::ConnectError, util::WrappedStream};

pub mod duplex;

pub use duplex::{DuplexDialer, DuplexListener};

const DEFAULT_WS_PORT: u16 = 80;

/// Host and port a [Dialer] connects to, resolved from a `ws://` URI
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
  pub host: String,
  pub port: u16,
}

impl Target {
  pub fn new<T: Into<String>>(host: T, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }

  /// Resolves the dial target of a websocket URI
  ///
  /// Only plaintext `ws` is supported; TLS is left to a wrapping [Dialer].
  pub fn from_uri(uri: &Uri) -> Result<Self, ConnectError> {
    match uri.scheme_str() {
      Some(scheme) if scheme.eq_ignore_ascii_case("ws") => (),
      Some(scheme) if scheme.eq_ignore_ascii_case("wss") => {
        return Err(ConnectError::invalid_target(
          "TLS (wss) targets are not supported by this client",
        ))
      }
      Some(other) => {
        return Err(ConnectError::invalid_target(format!(
          "Unsupported scheme {:?}",
          other
        )))
      }
      None => return Err(ConnectError::invalid_target("Target URI has no scheme")),
    }
    let host = uri
      .host()
      .filter(|host| !host.is_empty())
      .ok_or_else(|| ConnectError::invalid_target("Target URI has no host"))?;
    // Bracketed IPv6 hosts are dialed without their brackets
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok(Self::new(host, uri.port_u16().unwrap_or(DEFAULT_WS_PORT)))
  }
}

impl std::fmt::Display for Target {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.host.contains(':') {
      write!(f, "[{}]:{}", self.host, self.port)
    } else {
      write!(f, "{}:{}", self.host, self.port)
    }
  }
}

/// Opens byte-stream connections to targets
#[cfg_attr(test, mockall::automock)]
pub trait Dialer: Send + Sync {
  fn dial(&self, target: &Target) -> BoxFuture<'static, Result<WrappedStream, std::io::Error>>;
}

/// Dials plain TCP with `TCP_NODELAY` set
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl TcpDialer {
  pub fn new() -> Self {
    Self
  }
}

impl Dialer for TcpDialer {
  fn dial(&self, target: &Target) -> BoxFuture<'static, Result<WrappedStream, std::io::Error>> {
    let target = target.clone();
    async move {
      let stream = tokio::net::TcpStream::connect((target.host.as_str(), target.port)).await?;
      stream.set_nodelay(true)?;
      tracing::trace!(%target, peer = ?stream.peer_addr().ok(), "tcp_dialed");
      Ok(WrappedStream::Tcp(stream))
    }
    .boxed()
  }
}
