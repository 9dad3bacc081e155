//! Timeout and interrupt supervision
//!
//! Two independent clocks bound an operation. The client races a short,
//! fixed acknowledgement timer against the gateway's ack (see
//! [`race_ack`]). Inside the gateway an adapter wraps its backend call in a
//! [`Watch`], which enforces the caller's optional `timeout_ms` (refreshed on
//! every streamed chunk, so only a stalled generation expires) and observes
//! the adapter's [`InterruptSignal`].
//!
//! Adapters pick how an interrupt reaches the backend call:
//! - [`Cancellation::Cooperative`]: the call runs to its next yield point
//!   (a received chunk, or the end of a sync call) and stops there.
//! - [`Cancellation::Abortable`]: the in-flight HTTP future is dropped as
//!   soon as the token fires, aborting the request.

use std::future::Future;
use std::time::Duration;
use futures::{Stream, StreamExt};
use log::{debug, error};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;
use crate::providers::StreamChunk;

/// Fixed connection-liveness timeout for acknowledgements
pub const ACK_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Race a one-shot waiter against the acknowledgement timeout.
///
/// `None` means the timer won, or the waiter was discarded.
pub async fn race_ack<T>(
  waiter: oneshot::Receiver<T>
, timeout: Duration
) -> Option<T>
{   match tokio::time::timeout(timeout, waiter).await
    {   Ok(Ok(value)) => Some(value)
      , Ok(Err(_)) => {
          debug!("Ack waiter dropped before resolution");
          None
        }
      , Err(_) => None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation
{   Cooperative
  , Abortable
}

/// Interrupt state owned by one adapter instance.
///
/// Every generation started while no interrupt is pending shares the same
/// token, so one interrupt reaches all of them. A fired token is replaced
/// by the next generation that starts.
#[derive(Debug, Default)]
pub struct InterruptSignal
{   current: Mutex<CancellationToken>
}

impl InterruptSignal
{   pub fn new() -> Self
    {   InterruptSignal::default()
    }

    /// Token for a generation that is about to start
    pub async fn begin(&self) -> CancellationToken
    {   let mut current = self.current.lock().await;
        if current.is_cancelled()
        {   *current = CancellationToken::new();
        }
        current.clone()
    }

    pub async fn interrupt(&self)
    {   debug!("Interrupt requested");
        self.current.lock().await.cancel();
    }
}

/// Per-generation supervisor
#[derive(Debug)]
pub struct Watch
{   token: CancellationToken
  , mode: Cancellation
  , timeout: Option<Duration>
  , deadline: Option<Instant>
}

impl Watch
{   pub fn new(
      token: CancellationToken
    , mode: Cancellation
    , timeout_ms: Option<u64>
    ) -> Self
    {   let timeout = timeout_ms
          .filter(|ms| *ms > 0)
          .map(Duration::from_millis);
        Watch
        {   token
          , mode
          , timeout
          , deadline: timeout.map(|t| Instant::now() + t)
        }
    }

    /// Push the deadline out by one full timeout
    pub fn refresh(&mut self)
    {   if let Some(timeout) = self.timeout
        {   self.deadline = Some(Instant::now() + timeout);
        }
    }

    pub fn is_interrupted(&self) -> bool
    {   self.token.is_cancelled()
    }

    async fn expired(deadline: Option<Instant>)
    {   match deadline
        {   Some(deadline) => tokio::time::sleep_until(deadline).await
          , None => std::future::pending::<()>().await
        }
    }

    async fn aborted(token: &CancellationToken, mode: Cancellation)
    {   match mode
        {   Cancellation::Abortable => token.cancelled().await
          , Cancellation::Cooperative => std::future::pending::<()>().await
        }
    }

    /// Run one backend call under the deadline.
    ///
    /// A call is not started once the interrupt has fired. Otherwise a
    /// cooperative watch reports the interrupt once the call returns, or
    /// once the deadline cuts it short.
    pub async fn call<F>(&self, call: F) -> Result<F::Output, ErrorKind>
    where
      F: Future
    {   if self.is_interrupted()
        {   debug!("Interrupted before the backend call started");
            return Err(ErrorKind::Interrupt);
        }

        let outcome = tokio::select!
        { biased;
          _ = Watch::aborted(&self.token, self.mode) => {
            debug!("Backend call aborted by interrupt");
            Err(ErrorKind::Interrupt)
          }
        , _ = Watch::expired(self.deadline) => {
            error!(
              "Generate timeout, request took longer than {:?}",
              self.timeout
            );
            Err(ErrorKind::Timeout)
          }
        , output = call => Ok(output)
        };

        match outcome
        {   Ok(_) | Err(ErrorKind::Timeout) if self.is_interrupted() => {
              Err(ErrorKind::Interrupt)
            }
          , other => other
        }
    }

    /// Pull the next stream item under the deadline.
    ///
    /// Each received item refreshes the deadline and is a yield point at
    /// which a cooperative interrupt is observed.
    pub async fn next<S>(
      &mut self
    , stream: &mut S
    ) -> Result<Option<S::Item>, ErrorKind>
    where
      S: Stream + Unpin
    {   if self.is_interrupted()
        {   return Err(ErrorKind::Interrupt);
        }

        let item = self.call(stream.next()).await?;
        if item.is_some()
        {   self.refresh();
        }
        Ok(item)
    }
}

/// Chunk callback handed to streaming adapters.
pub type ChunkSender = mpsc::UnboundedSender<StreamChunk>;

/// Forwards fragments and guarantees exactly one terminal marker.
///
/// The marker is sent by [`ChunkSink::finish`], or on drop when a
/// generation leaves early.
pub struct ChunkSink
{   tx: ChunkSender
  , finished: bool
}

impl ChunkSink
{   pub fn new(tx: ChunkSender) -> Self
    {   ChunkSink
        {   tx
          , finished: false
        }
    }

    pub fn push(&self, fragment: impl Into<String>)
    {   if self.finished
        {   return;
        }
        let _ = self.tx.send(StreamChunk::fragment(fragment));
    }

    /// Emit the terminal marker and pass the outcome through
    pub fn finish(mut self, outcome: ErrorKind) -> ErrorKind
    {   self.close();
        outcome
    }

    fn close(&mut self)
    {   if !self.finished
        {   self.finished = true;
            let _ = self.tx.send(StreamChunk::end());
        }
    }
}

impl Drop for ChunkSink
{   fn drop(&mut self)
    {   self.close();
    }
}
