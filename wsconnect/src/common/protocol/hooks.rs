// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Caller-supplied observers of the upgrade
//!
//! Both capability sets are synchronous and invoked once per attempt on the
//! task driving the upgrade. An `Err` from any of them aborts the attempt.

use std::sync::Arc;

use super::{
  handshake::{UpgradeRequest, UpgradeResponse},
  session::Session,
  HookError,
};

/// Observes (and may amend) the handshake request and observes its response
pub trait UpgradeListener: Send + Sync {
  fn on_handshake_request(&self, _request: &mut UpgradeRequest) -> Result<(), HookError> {
    Ok(())
  }

  fn on_handshake_response(&self, _response: &UpgradeResponse) -> Result<(), HookError> {
    Ok(())
  }
}

/// Observes sessions as soon as they are created, before the protocol switch
pub trait SessionListener: Send + Sync {
  fn on_session_created(&self, session: &Session) -> Result<(), HookError>;
}

impl<F> SessionListener for F
where
  F: Fn(&Session) -> Result<(), HookError> + Send + Sync,
{
  fn on_session_created(&self, session: &Session) -> Result<(), HookError> {
    (self)(session)
  }
}

type RequestHook = Arc<dyn Fn(&mut UpgradeRequest) -> Result<(), HookError> + Send + Sync>;
type ResponseHook = Arc<dyn Fn(&UpgradeResponse) -> Result<(), HookError> + Send + Sync>;

/// An [UpgradeListener] assembled from closures; unset hooks are no-ops
#[derive(Clone, Default)]
pub struct UpgradeHooks {
  on_request: Option<RequestHook>,
  on_response: Option<ResponseHook>,
}

impl UpgradeHooks {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn on_request<F>(mut self, f: F) -> Self
  where
    F: Fn(&mut UpgradeRequest) -> Result<(), HookError> + Send + Sync + 'static,
  {
    self.on_request = Some(Arc::new(f));
    self
  }

  pub fn on_response<F>(mut self, f: F) -> Self
  where
    F: Fn(&UpgradeResponse) -> Result<(), HookError> + Send + Sync + 'static,
  {
    self.on_response = Some(Arc::new(f));
    self
  }
}

impl std::fmt::Debug for UpgradeHooks {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("UpgradeHooks")
      .field("on_request", &self.on_request.is_some())
      .field("on_response", &self.on_response.is_some())
      .finish()
  }
}

impl UpgradeListener for UpgradeHooks {
  fn on_handshake_request(&self, request: &mut UpgradeRequest) -> Result<(), HookError> {
    match &self.on_request {
      Some(hook) => hook(request),
      None => Ok(()),
    }
  }

  fn on_handshake_response(&self, response: &UpgradeResponse) -> Result<(), HookError> {
    match &self.on_response {
      Some(hook) => hook(response),
      None => Ok(()),
    }
  }
}

/// Notifies listeners in registration order, stopping at the first failure
pub(crate) fn notify_session_created(
  listeners: &[Arc<dyn SessionListener>],
  session: &Session,
) -> Result<(), HookError> {
  for (index, listener) in listeners.iter().enumerate() {
    if let Err(error) = listener.on_session_created(session) {
      tracing::debug!(
        session_id = ?session.id(),
        listener = index,
        error = %error,
        "session_listener_failed"
      );
      return Err(error);
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::sync::{Arc, Mutex};

  use tokio_tungstenite::tungstenite::http::{header, HeaderMap, HeaderValue, StatusCode};

  use super::{notify_session_created, SessionListener, UpgradeHooks, UpgradeListener};
  use crate::common::protocol::{
    handshake::{UpgradeRequest, UpgradeResponse},
    session::Session,
  };

  #[test]
  fn hooks_default_to_no_ops() {
    let hooks = UpgradeHooks::new();
    let mut request = UpgradeRequest::new("ws://localhost/".parse().unwrap());
    hooks.on_handshake_request(&mut request).unwrap();
    hooks
      .on_handshake_response(&UpgradeResponse::new(
        StatusCode::SWITCHING_PROTOCOLS,
        HeaderMap::new(),
      ))
      .unwrap();
  }

  #[test]
  fn request_hook_may_amend_request() {
    let hooks = UpgradeHooks::new().on_request(|request| {
      request
        .headers_mut()
        .insert(header::ORIGIN, HeaderValue::from_static("http://example"));
      Ok(())
    });
    let mut request = UpgradeRequest::new("ws://localhost/".parse().unwrap());
    hooks.on_handshake_request(&mut request).unwrap();
    assert_eq!(request.headers()[header::ORIGIN], "http://example");
  }

  #[test]
  fn session_listeners_run_in_order_and_halt_on_failure() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let listener = |tag: &'static str, fail: bool| {
      let calls = calls.clone();
      Arc::new(move |_: &Session| {
        calls.lock().unwrap().push(tag);
        if fail {
          Err(anyhow::anyhow!("{} refused", tag))
        } else {
          Ok(())
        }
      }) as Arc<dyn SessionListener>
    };
    let listeners = vec![
      listener("first", false),
      listener("second", true),
      listener("third", false),
    ];
    let session = Session::detached_for_test();
    let error = notify_session_created(&listeners, &session).expect_err("Second must fail");
    assert_eq!(error.to_string(), "second refused");
    assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
  }
}
