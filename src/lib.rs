//! UART <-> TCP bridge firmware
//!
//! Exposes a serial port over a single-client TCP socket, keeps the device on
//! a WiFi network (falling back to a provisioning access point) and serves
//! maintenance endpoints for credentials, firmware upgrade and reset.

pub mod bridge;
pub mod config;
pub mod error;
pub mod http;
pub mod ota;
pub mod relay;
pub mod slot;
pub mod storage;
pub mod uart;
pub mod wifi;

pub use bridge::BridgeEngine;
pub use config::{create_config, AppConfig};
pub use error::{Error, Result};
pub use wifi::{ConnectionState, NetworkEvent, WiFiManager};
