// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{path::Path, time::Duration};

use anyhow::{Error as AnyErr, Result};
use tokio_tungstenite::tungstenite::http::Uri;

use crate::common::transport::Target;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

/// Parses a URI this client is able to dial
pub fn parse_ws_uri(v: &str) -> Result<Uri> {
  let uri = v
    .parse::<Uri>()
    .map_err(|e| AnyErr::msg(format!("Could not parse {:?} as a URI: {}", v, e)))?;
  Target::from_uri(&uri)?;
  Ok(uri)
}

pub fn parse_millis(v: &str) -> Result<Duration> {
  v.parse::<u64>()
    .map(Duration::from_millis)
    .map_err(|_| AnyErr::msg("Expected a whole number of milliseconds"))
}

pub fn validate_ws_uri(v: &str) -> Result<(), String> {
  parse_ws_uri(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_millis(v: &str) -> Result<(), String> {
  parse_millis(v).map(|_| ()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::{parse_millis, parse_ws_uri, validate_ws_uri};

  #[test]
  fn uris_must_be_dialable() {
    assert_eq!(
      parse_ws_uri("ws://localhost:9001/chat").unwrap().path(),
      "/chat"
    );
    assert!(validate_ws_uri("wss://localhost/").is_err());
    assert!(validate_ws_uri("not a uri").is_err());
  }

  #[test]
  fn millis() {
    assert_eq!(parse_millis("250").unwrap(), Duration::from_millis(250));
    assert!(parse_millis("-1").is_err());
  }
}
