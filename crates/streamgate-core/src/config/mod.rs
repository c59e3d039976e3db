//! Gateway configuration
//!
//! This module defines configuration types and default values:
//! - `gateway_config`: Configuration structure
//! - `defaults`: Default configuration values

pub mod defaults;
pub mod gateway_config;

pub use gateway_config::{
    AuxServerConfig, GatewayConfig, PayloadConfig, PlatformConfig, RequestConfig,
    TransportConfig,
};
