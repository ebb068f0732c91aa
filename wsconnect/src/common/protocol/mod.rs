// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The client-side websocket upgrade pipeline
//!
//! An attempt moves from dialing, through the HTTP/1.1 upgrade handshake and
//! session creation, to an open session handed to the caller's [Endpoint].
//! Its progress and result are observed through a [ConnectOutcome].

pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod hooks;
pub mod outcome;
pub mod process;
pub mod session;

pub use endpoint::{Endpoint, EndpointDispatcher};
pub use error::{ConnectError, HookError, UpgradeError};
pub use handshake::{
  HandshakeCodec, Http11Codec, ReceivedResponse, UpgradeRequest, UpgradeResponse,
};
pub use hooks::{SessionListener, UpgradeHooks, UpgradeListener};
pub use outcome::{ConnectOutcome, OutcomeState};
pub use process::Phase;
pub use session::{Message, Session, SessionError, SessionId, SessionState};
