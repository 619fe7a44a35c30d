//! Peripheral connection management

mod adapter;
mod connection;
mod discovery;
mod options;
mod peripheral;
mod rssi;
mod snapshot;
pub mod events;
pub mod timeout;
pub mod transport;

pub use adapter::{BtleplugTransport, ScannedPeripheral, UNKNOWN_RSSI};

pub use events::{
    ConnectionEvent, ConnectionResult, ConnectionUpdate, EventStream, RssiResult,
};

pub use options::{ConnectOptions, RetryBudget};

pub use peripheral::Peripheral;

pub use snapshot::{
    Advertisement, ConnectionState, DiscoveredCharacteristic, DiscoveredService, PeripheralId,
    PeripheralSnapshot, Termination,
};

pub use timeout::{TimeoutScheduler, TimerId};

pub use transport::{Attempt, Callback, Transport, TransportEvent};
