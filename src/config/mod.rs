//! Settings management

mod link_config;

pub use link_config::{LinkConfig, LogLevel};
