// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![forbid(unused_imports, dead_code)]
use futures::{future::BoxFuture, stream::BoxStream, FutureExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedSender};

use super::{Dialer, Target};
use crate::util::WrappedStream;

const DUPLEX_BUFFER_SIZE: usize = 8192;

/// A [Dialer] which connects to an entangled [DuplexListener] in memory
///
/// Every dial produces a fresh duplex pair; the near end is returned to the
/// dialer and the far end, with the dialed target, is handed to the listener.
#[derive(Clone)]
pub struct DuplexDialer {
  channel_to_listener: UnboundedSender<(Target, WrappedStream)>,
}

/// The accepting side of a [DuplexDialer]
pub struct DuplexListener {
  incoming: BoxStream<'static, (Target, WrappedStream)>,
}

impl DuplexListener {
  /// Receives the next dialed stream, or `None` once every dialer is dropped
  pub async fn accept(&mut self) -> Option<(Target, WrappedStream)> {
    self.incoming.next().await
  }

  pub fn into_stream(self) -> BoxStream<'static, (Target, WrappedStream)> {
    self.incoming
  }
}

/// Produces an entangled dialer and listener pair
pub fn channel() -> (DuplexDialer, DuplexListener) {
  use tokio_stream::wrappers::UnboundedReceiverStream;
  let (up, down) = mpsc::unbounded_channel();
  (
    DuplexDialer {
      channel_to_listener: up,
    },
    DuplexListener {
      incoming: UnboundedReceiverStream::new(down).boxed(),
    },
  )
}

impl Dialer for DuplexDialer {
  fn dial(&self, target: &Target) -> BoxFuture<'static, Result<WrappedStream, std::io::Error>> {
    let (local, remote) = WrappedStream::duplex(DUPLEX_BUFFER_SIZE);
    futures::future::ready(
      self
        .channel_to_listener
        .send((target.clone(), remote))
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
        .map(|_| local),
    )
    .boxed()
  }
}
