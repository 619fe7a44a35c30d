//! Connection outcomes and the streams that carry them

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::bluetooth::snapshot::PeripheralSnapshot;
use crate::error::PeripheralError;

/// Outcome of a connection attempt or of an established connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    /// The link is up
    Connect,
    /// The attempt timed out; call `reconnect()` to try again
    Timeout,
    /// The link dropped without error; call `reconnect()` to try again
    Disconnect,
    /// The link was closed by the caller
    ForceDisconnect,
    /// A retry budget is exhausted; the stream ends after this
    GiveUp,
}

impl ConnectionEvent {
    /// Whether no further events follow on the same stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::GiveUp)
    }
}

/// A connection event together with the peripheral state it produced
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionUpdate {
    /// Snapshot taken when the event was emitted
    pub peripheral: PeripheralSnapshot,
    /// What happened
    pub event: ConnectionEvent,
}

/// Item of a connection stream
pub type ConnectionResult = Result<ConnectionUpdate, PeripheralError>;

/// Item of an RSSI polling stream
pub type RssiResult = Result<i16, PeripheralError>;

/// Multi-value result stream
///
/// Ends when the producing side drops its sender.
#[derive(Debug)]
pub struct EventStream<T> {
    inner: UnboundedReceiverStream<T>,
}

impl<T> EventStream<T> {
    /// Create a connected sender/stream pair
    pub(crate) fn channel() -> (UnboundedSender<T>, Self) {
        let (tx, rx) = unbounded_channel();
        (tx, Self::from_receiver(rx))
    }

    pub(crate) fn from_receiver(rx: UnboundedReceiver<T>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
