// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! HTTP/1.1 upgrade handshake: request construction, response parsing, and validation

use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::{
  self,
  client::IntoClientRequest,
  handshake::{
    client::{generate_key, generate_request},
    derive_accept_key,
  },
  http::{
    header::{self, HeaderName},
    HeaderMap, HeaderValue, StatusCode, Uri,
  },
};

use super::UpgradeError;
use crate::util::WrappedStream;

/// Upper bound on response header lines, matching tungstenite's own parser
const MAX_RESPONSE_HEADERS: usize = 124;
const READ_CHUNK: usize = 1024;

/// Headers the handshake depends on; each may appear at most once
static HANDSHAKE_HEADERS: [HeaderName; 5] = [
  header::HOST,
  header::CONNECTION,
  header::UPGRADE,
  header::SEC_WEBSOCKET_VERSION,
  header::SEC_WEBSOCKET_KEY,
];

/// The client's upgrade request, open to modification by an upgrade listener before it is sent
///
/// Headers set here replace the generated ones of the same name, so a listener
/// may override `Host` or `Sec-WebSocket-Key` without duplicating them.
#[derive(Clone, Debug)]
pub struct UpgradeRequest {
  uri: Uri,
  key: String,
  headers: HeaderMap,
  subprotocols: Vec<String>,
}

impl UpgradeRequest {
  pub fn new(uri: Uri) -> Self {
    Self {
      uri,
      key: generate_key(),
      headers: HeaderMap::new(),
      subprotocols: Vec::new(),
    }
  }

  pub fn uri(&self) -> &Uri {
    &self.uri
  }

  /// The `Sec-WebSocket-Key` nonce the response must answer
  pub fn key(&self) -> &str {
    self
      .headers
      .get(header::SEC_WEBSOCKET_KEY)
      .and_then(|v| v.to_str().ok())
      .unwrap_or(&self.key)
  }

  /// Headers sent with the request in addition to, or in place of, the generated ones
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }

  pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
    self.headers.append(name, value);
    self
  }

  pub fn subprotocols(&self) -> &[String] {
    &self.subprotocols
  }

  pub fn add_subprotocol<T: Into<String>>(&mut self, protocol: T) {
    self.subprotocols.push(protocol.into());
  }

  /// Serializes the request head, ready to be written to the transport
  ///
  /// Naming a handshake header such as `Upgrade` more than once is a protocol violation.
  pub fn to_head(&self, user_agent: Option<&str>) -> Result<Vec<u8>, UpgradeError> {
    for name in HANDSHAKE_HEADERS.iter() {
      if self.headers.get_all(name).iter().count() > 1 {
        return Err(UpgradeError::protocol_violation(format!(
          "Handshake header {} given more than once",
          name
        )));
      }
    }
    let mut request = self
      .uri
      .clone()
      .into_client_request()
      .map_err(invalid_request)?;
    let generated = request.headers_mut();
    generated.insert(header::SEC_WEBSOCKET_KEY, header_value(&self.key)?);
    if !self.subprotocols.is_empty() {
      generated.insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        header_value(&self.subprotocols.join(", "))?,
      );
    }
    if let Some(user_agent) = user_agent {
      generated.insert(header::USER_AGENT, header_value(user_agent)?);
    }
    for name in self.headers.keys() {
      generated.remove(name);
    }
    for (name, value) in self.headers.iter() {
      generated.append(name.clone(), value.clone());
    }
    let (head, _key) = generate_request(request).map_err(invalid_request)?;
    Ok(head)
  }
}

fn header_value(value: &str) -> Result<HeaderValue, UpgradeError> {
  HeaderValue::from_str(value)
    .map_err(|_| UpgradeError::protocol_violation(format!("Invalid header value {:?}", value)))
}

fn invalid_request(e: tungstenite::Error) -> UpgradeError {
  UpgradeError::protocol_violation(format!("Invalid upgrade request: {}", e))
}

/// The server's answer to an [UpgradeRequest]
#[derive(Clone, Debug)]
pub struct UpgradeResponse {
  status: StatusCode,
  reason: Option<String>,
  headers: HeaderMap,
}

impl UpgradeResponse {
  pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
    Self {
      status,
      reason: None,
      headers,
    }
  }

  pub fn status(&self) -> StatusCode {
    self.status
  }

  pub fn reason(&self) -> Option<&str> {
    self.reason.as_deref()
  }

  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// The subprotocol selected by the server, if it selected one
  pub fn accepted_subprotocol(&self) -> Option<&str> {
    self
      .headers
      .get(header::SEC_WEBSOCKET_PROTOCOL)
      .and_then(|v| v.to_str().ok())
      .map(str::trim)
  }

  /// Parses a response head from the start of `buf`
  ///
  /// Yields `None` until the head is complete, then the head's length in bytes
  /// alongside the response.
  pub fn try_parse(buf: &[u8]) -> Result<Option<(usize, Self)>, UpgradeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut raw = httparse::Response::new(&mut headers);
    let len = match raw.parse(buf) {
      Ok(httparse::Status::Partial) => return Ok(None),
      Ok(httparse::Status::Complete(len)) => len,
      Err(e) => {
        return Err(UpgradeError::protocol_violation(format!(
          "Malformed response head: {}",
          e
        )))
      }
    };
    let status = raw
      .code
      .and_then(|code| StatusCode::from_u16(code).ok())
      .ok_or_else(|| UpgradeError::protocol_violation("Response carried no valid status code"))?;
    let reason = raw
      .reason
      .map(str::trim)
      .filter(|r| !r.is_empty())
      .map(String::from);
    let mut parsed = HeaderMap::with_capacity(raw.headers.len());
    for line in raw.headers.iter() {
      let name = HeaderName::from_bytes(line.name.as_bytes()).map_err(|_| {
        UpgradeError::protocol_violation(format!("Invalid header name {:?}", line.name))
      })?;
      let value = HeaderValue::from_bytes(line.value).map_err(|_| {
        UpgradeError::protocol_violation(format!("Invalid value for header {}", name))
      })?;
      parsed.append(name, value);
    }
    Ok(Some((
      len,
      Self {
        status,
        reason,
        headers: parsed,
      },
    )))
  }

  /// Parses a complete response head, including its terminating blank line
  pub fn parse(head: &[u8]) -> Result<Self, UpgradeError> {
    match Self::try_parse(head)? {
      Some((_len, response)) => Ok(response),
      None => Err(UpgradeError::protocol_violation("Incomplete response head")),
    }
  }
}

/// A parsed response and whatever the server sent after its head
#[derive(Debug)]
pub struct ReceivedResponse {
  pub response: UpgradeResponse,
  /// Bytes read past the head; the start of the websocket stream
  pub remainder: Vec<u8>,
}

impl From<UpgradeResponse> for ReceivedResponse {
  fn from(response: UpgradeResponse) -> Self {
    Self {
      response,
      remainder: Vec::new(),
    }
  }
}

fn header_has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
  headers
    .get_all(name)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Writes upgrade requests and reads their responses on a freshly dialed transport
pub trait HandshakeCodec: Send + Sync {
  fn send_request<'a>(
    &'a self,
    channel: &'a mut WrappedStream,
    request: &'a UpgradeRequest,
  ) -> BoxFuture<'a, Result<(), UpgradeError>>;

  fn receive_response<'a>(
    &'a self,
    channel: &'a mut WrappedStream,
  ) -> BoxFuture<'a, Result<ReceivedResponse, UpgradeError>>;

  /// Decides whether a parsed response actually completes the upgrade for the request
  fn validate(
    &self,
    request: &UpgradeRequest,
    response: &UpgradeResponse,
  ) -> Result<(), UpgradeError>;
}

/// RFC 6455 client handshake over HTTP/1.1
#[derive(Clone, Debug)]
pub struct Http11Codec {
  max_head_size: usize,
  user_agent: Option<String>,
}

impl Http11Codec {
  pub fn new(max_head_size: usize, user_agent: Option<String>) -> Self {
    Self {
      max_head_size,
      user_agent,
    }
  }
}

impl Default for Http11Codec {
  fn default() -> Self {
    Self::new(8 * 1024, None)
  }
}

impl HandshakeCodec for Http11Codec {
  fn send_request<'a>(
    &'a self,
    channel: &'a mut WrappedStream,
    request: &'a UpgradeRequest,
  ) -> BoxFuture<'a, Result<(), UpgradeError>> {
    async move {
      let head = request.to_head(self.user_agent.as_deref())?;
      channel.write_all(&head).await?;
      channel.flush().await?;
      tracing::trace!(uri = %request.uri(), bytes = head.len(), "upgrade_request_sent");
      Ok(())
    }
    .boxed()
  }

  fn receive_response<'a>(
    &'a self,
    channel: &'a mut WrappedStream,
  ) -> BoxFuture<'a, Result<ReceivedResponse, UpgradeError>> {
    async move {
      let mut buf = Vec::with_capacity(READ_CHUNK);
      loop {
        if let Some((len, response)) = UpgradeResponse::try_parse(&buf)? {
          let remainder = buf.split_off(len);
          tracing::trace!(
            status = %response.status(),
            remainder = remainder.len(),
            "upgrade_response_received"
          );
          return Ok(ReceivedResponse {
            response,
            remainder,
          });
        }
        if buf.len() >= self.max_head_size {
          return Err(UpgradeError::protocol_violation(format!(
            "Response head exceeded {} bytes",
            self.max_head_size
          )));
        }
        buf.reserve(READ_CHUNK);
        if channel.read_buf(&mut buf).await? == 0 {
          return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
      }
    }
    .boxed()
  }

  fn validate(
    &self,
    request: &UpgradeRequest,
    response: &UpgradeResponse,
  ) -> Result<(), UpgradeError> {
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
      return Err(UpgradeError::Rejected {
        status: response.status().as_u16(),
        reason: response.reason().map(|r| std::sync::Arc::new(r.to_string())),
      });
    }
    let headers = response.headers();
    if !header_has_token(headers, &header::UPGRADE, "websocket") {
      return Err(UpgradeError::protocol_violation(
        "Missing `Upgrade: websocket` in response",
      ));
    }
    if !header_has_token(headers, &header::CONNECTION, "upgrade") {
      return Err(UpgradeError::protocol_violation(
        "Missing `Connection: upgrade` in response",
      ));
    }
    let expected_accept = derive_accept_key(request.key().as_bytes());
    match headers
      .get(header::SEC_WEBSOCKET_ACCEPT)
      .and_then(|v| v.to_str().ok())
    {
      Some(accept) if accept.trim() == expected_accept => (),
      Some(_) => {
        return Err(UpgradeError::protocol_violation(
          "Sec-WebSocket-Accept does not match the request key",
        ))
      }
      None => {
        return Err(UpgradeError::protocol_violation(
          "Missing Sec-WebSocket-Accept in response",
        ))
      }
    }
    if let Some(selected) = response.accepted_subprotocol() {
      if !request.subprotocols().iter().any(|p| p == selected) {
        return Err(UpgradeError::protocol_violation(format!(
          "Server selected unrequested subprotocol {:?}",
          selected
        )));
      }
    }
    Ok(())
  }
}
