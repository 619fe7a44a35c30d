//! Read-only peripheral state published to callers

use std::collections::HashMap;
use std::fmt;

use btleplug::api::PeripheralProperties;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bluetooth::transport::Attempt;

/// Opaque, stable handle of a peripheral as assigned by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Advertised metadata captured when the peripheral was discovered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Advertised local name
    pub local_name: Option<String>,
    /// Manufacturer specific data keyed by company identifier
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service data keyed by service UUID
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
    /// Transmit power level if available
    pub tx_power_level: Option<i16>,
}

impl Advertisement {
    /// Advertisement carrying only a local name
    pub fn named<S: Into<String>>(name: S) -> Self {
        Self {
            local_name: Some(name.into()),
            ..Self::default()
        }
    }
}

impl From<&PeripheralProperties> for Advertisement {
    fn from(properties: &PeripheralProperties) -> Self {
        Self {
            local_name: properties.local_name.clone(),
            manufacturer_data: properties.manufacturer_data.clone(),
            service_data: properties.service_data.clone(),
            services: properties.services.clone(),
            tx_power_level: properties.tx_power_level,
        }
    }
}

/// A characteristic reported by characteristic discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveredCharacteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// UUID of the service the characteristic belongs to
    pub service_uuid: Uuid,
    /// GATT property bits (broadcast, read, write, notify, ...)
    pub properties: u8,
}

impl From<&btleplug::api::Characteristic> for DiscoveredCharacteristic {
    fn from(characteristic: &btleplug::api::Characteristic) -> Self {
        Self {
            uuid: characteristic.uuid,
            service_uuid: characteristic.service_uuid,
            properties: characteristic.properties.bits(),
        }
    }
}

/// A service reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveredService {
    /// Service UUID
    pub uuid: Uuid,
    /// Whether this is a primary service
    pub primary: bool,
    /// Characteristics, filled in by a full peripheral discovery
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

impl DiscoveredService {
    pub fn primary(uuid: Uuid) -> Self {
        Self {
            uuid,
            primary: true,
            characteristics: Vec::new(),
        }
    }
}

impl From<&btleplug::api::Service> for DiscoveredService {
    fn from(service: &btleplug::api::Service) -> Self {
        Self {
            uuid: service.uuid,
            primary: service.primary,
            characteristics: Vec::new(),
        }
    }
}

/// Why a connection lifecycle ended for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Termination {
    /// A retry budget was exhausted
    GiveUp,
}

/// Connection state of a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Terminal; only a fresh `connect()` leaves this state
    Terminated(Termination),
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Terminated(Termination::GiveUp) => write!(f, "terminated (gave up)"),
        }
    }
}

/// Point-in-time view of a peripheral
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralSnapshot {
    /// Transport handle
    pub id: PeripheralId,
    /// Advertisement captured at discovery
    pub advertisement: Advertisement,
    /// Last known signal strength
    pub rssi: i16,
    /// Current connection state
    pub state: ConnectionState,
    /// Services found by the last successful discovery
    pub services: Vec<DiscoveredService>,
    /// Attempt token of the current connection
    pub(crate) link: Attempt,
}

impl PeripheralSnapshot {
    pub(crate) fn new(
        id: PeripheralId,
        advertisement: Advertisement,
        rssi: i16,
        state: ConnectionState,
    ) -> Self {
        Self {
            id,
            advertisement,
            rssi,
            state,
            services: Vec::new(),
            link: Attempt::INITIAL,
        }
    }

    /// Whether the state machine reports the peripheral connected
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Advertised name, if any
    pub fn name(&self) -> Option<&str> {
        self.advertisement.local_name.as_deref()
    }
}
