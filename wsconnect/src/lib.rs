// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Cancellable client-side websocket connections
//!
//! [UpgradeClient] dials a `ws://` target, performs the HTTP/1.1 upgrade,
//! and hands the resulting [Session] to a caller-supplied [Endpoint]. Each
//! attempt is represented by a [ConnectOutcome] which may be awaited or
//! cancelled at any point.

pub mod client;
pub mod common;
pub mod util;

pub use client::UpgradeClient;
pub use common::{
  config::ClientConfig,
  protocol::{
    session::{SequentialSessionIds, SessionIdGenerator},
    ConnectError, ConnectOutcome, Endpoint, HookError, Message, OutcomeState, Phase, Session,
    SessionError, SessionId, SessionListener, UpgradeError, UpgradeHooks, UpgradeListener,
    UpgradeRequest, UpgradeResponse,
  },
};
pub use tokio_tungstenite::tungstenite::http::Uri;
