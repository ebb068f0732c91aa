// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Tunables for an [UpgradeClient](crate::client::UpgradeClient)
///
/// Timeouts are stored as milliseconds so the structure round-trips through
/// JSON; a value of zero means "no bound".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
  /// Bound on establishing the transport
  pub connect_timeout_ms: u64,
  /// Bound on receiving the upgrade response after the request is sent
  pub handshake_timeout_ms: u64,
  /// Largest upgrade response head accepted, in bytes
  pub max_handshake_size: usize,
  /// Largest inbound message, in bytes
  pub max_message_size: usize,
  /// Largest single inbound frame, in bytes
  pub max_frame_size: usize,
  /// Value of the `User-Agent` header, if any
  pub user_agent: Option<String>,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      connect_timeout_ms: 10_000,
      handshake_timeout_ms: 0,
      max_handshake_size: 8 * 1024,
      max_message_size: 64 << 20,
      max_frame_size: 16 << 20,
      user_agent: Some(format!(
        "{}/{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
      )),
    }
  }
}

fn bound(ms: u64) -> Option<Duration> {
  match ms {
    0 => None,
    ms => Some(Duration::from_millis(ms)),
  }
}

impl ClientConfig {
  pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
    serde_json::from_slice(raw)
  }

  pub fn connect_timeout(&self) -> Option<Duration> {
    bound(self.connect_timeout_ms)
  }

  pub fn handshake_timeout(&self) -> Option<Duration> {
    bound(self.handshake_timeout_ms)
  }

  pub(crate) fn websocket_config(&self) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(self.max_message_size);
    config.max_frame_size = Some(self.max_frame_size);
    config
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::ClientConfig;

  #[test]
  fn partial_json_keeps_defaults() {
    let config = ClientConfig::from_json(br#"{ "handshake_timeout_ms": 2500 }"#)
      .expect("Partial config must deserialize");
    assert_eq!(config.handshake_timeout(), Some(Duration::from_millis(2500)));
    assert_eq!(
      config.connect_timeout(),
      ClientConfig::default().connect_timeout()
    );
  }

  #[test]
  fn zero_means_unbounded() {
    let config = ClientConfig {
      connect_timeout_ms: 0,
      ..Default::default()
    };
    assert_eq!(config.connect_timeout(), None);
  }

  #[test]
  fn unknown_fields_are_refused() {
    assert!(ClientConfig::from_json(br#"{ "retries": 3 }"#).is_err());
  }
}
