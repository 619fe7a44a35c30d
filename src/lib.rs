// Root module exports
pub mod bluetooth;
pub mod config;
pub mod error;
pub mod logging;

// Re-export common items for convenience
pub use bluetooth::{
    BtleplugTransport, ConnectOptions, ConnectionEvent, ConnectionState, Peripheral,
    PeripheralId, RetryBudget, Transport,
};
pub use config::LinkConfig;
pub use error::{PeripheralError, TransportError};
pub use logging::init_logger;
