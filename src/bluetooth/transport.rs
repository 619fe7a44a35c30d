//! Transport capability boundary
//!
//! The radio stack is consumed only through [`Transport`]. Every call is
//! fire-and-forget: completions come back as typed [`TransportEvent`]s posted
//! through the [`Callback`] handed to the call. The callback remembers the
//! attempt token that was current when the call was made, so the peripheral
//! can discard completions that belong to a superseded attempt.

use std::fmt;

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::bluetooth::snapshot::{DiscoveredCharacteristic, DiscoveredService, PeripheralId};
use crate::error::TransportError;

/// Monotonic token correlating an outbound transport call with its completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attempt(u64);

impl Attempt {
    /// Token of the connection a peripheral starts with
    pub const INITIAL: Attempt = Attempt(0);

    pub(crate) fn next(self) -> Attempt {
        Attempt(self.0 + 1)
    }
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Completion reported by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The link came up
    Connected,
    /// The link could not be established
    FailedToConnect(TransportError),
    /// The link went down, voluntarily or not
    Disconnected(Option<TransportError>),
    /// Service discovery finished
    ServicesDiscovered {
        services: Vec<DiscoveredService>,
        error: Option<TransportError>,
    },
    /// Characteristic discovery of one service finished
    CharacteristicsDiscovered {
        service: Uuid,
        characteristics: Vec<DiscoveredCharacteristic>,
        error: Option<TransportError>,
    },
    /// A signal strength read finished
    RssiRead {
        rssi: i16,
        error: Option<TransportError>,
    },
}

/// A transport event tagged with the attempt it answers
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TransportMessage {
    pub attempt: Attempt,
    pub event: TransportEvent,
}

/// Completion handle passed to every transport call
///
/// Sending after the peripheral has gone away is silently ignored.
#[derive(Clone)]
pub struct Callback {
    attempt: Attempt,
    sender: UnboundedSender<TransportMessage>,
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl Callback {
    pub(crate) fn new(attempt: Attempt, sender: UnboundedSender<TransportMessage>) -> Self {
        Self { attempt, sender }
    }

    /// The attempt this callback answers
    pub fn attempt(&self) -> Attempt {
        self.attempt
    }

    /// Post a raw event
    pub fn send(&self, event: TransportEvent) {
        let message = TransportMessage {
            attempt: self.attempt,
            event,
        };
        if self.sender.send(message).is_err() {
            log::debug!("Dropping transport event for attempt {}: peripheral is gone", self.attempt);
        }
    }

    pub fn connected(&self) {
        self.send(TransportEvent::Connected);
    }

    pub fn failed_to_connect(&self, error: TransportError) {
        self.send(TransportEvent::FailedToConnect(error));
    }

    pub fn disconnected(&self, error: Option<TransportError>) {
        self.send(TransportEvent::Disconnected(error));
    }

    pub fn services_discovered(&self, services: Vec<DiscoveredService>, error: Option<TransportError>) {
        self.send(TransportEvent::ServicesDiscovered { services, error });
    }

    pub fn characteristics_discovered(
        &self,
        service: Uuid,
        characteristics: Vec<DiscoveredCharacteristic>,
        error: Option<TransportError>,
    ) {
        self.send(TransportEvent::CharacteristicsDiscovered {
            service,
            characteristics,
            error,
        });
    }

    pub fn rssi_read(&self, rssi: i16, error: Option<TransportError>) {
        self.send(TransportEvent::RssiRead { rssi, error });
    }
}

/// Narrow interface to the radio stack
///
/// Implementations must not block: each request is answered later, exactly
/// once, through the supplied [`Callback`].
pub trait Transport: Send + Sync {
    /// Request a connection
    fn connect(&self, id: &PeripheralId, callback: Callback);

    /// Request a disconnection, or abandon a pending connection
    fn disconnect(&self, id: &PeripheralId, callback: Callback);

    /// Request discovery of all services
    fn discover_services(&self, id: &PeripheralId, callback: Callback);

    /// Request discovery of the characteristics of one service
    fn discover_characteristics(&self, id: &PeripheralId, service: Uuid, callback: Callback);

    /// Request a signal strength read
    fn read_rssi(&self, id: &PeripheralId, callback: Callback);

    /// Whether the radio stack currently reports the peripheral connected
    fn is_connected(&self, id: &PeripheralId) -> bool;
}
