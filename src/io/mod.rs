//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `hardware` - Hardware link trait
//! - `serial_link` - Serial connection to the timing device
//! - `simulator` - In-process timing device
//! - `http` - Command and status HTTP endpoint
//! - `prometheus` - Prometheus text format
//! - `mqtt_egress` - MQTT publisher for outbound events
//! - `event_log` - Structured log observer

pub mod event_log;
pub mod hardware;
pub mod http;
pub mod mqtt_egress;
pub mod prometheus;
pub mod serial_link;
pub mod simulator;

// Re-export commonly used types
pub use event_log::EventLogger;
pub use hardware::{Hardware, HardwareError};
pub use http::{start_http_server, HttpContext};
pub use mqtt_egress::MqttPublisher;
pub use serial_link::SerialLink;
pub use simulator::SimulatedHardware;
