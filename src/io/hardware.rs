//! Hardware link abstraction
//!
//! The race core talks to the timing device only through this trait:
//! a command goes out, the future resolves when the device acknowledges.
//! Sensor signals travel the other way through the `SensorGate`.

use crate::domain::types::Command;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("device disconnected")]
    Disconnected,
    #[error("device rejected {command}: {reason}")]
    Rejected { command: Command, reason: String },
    #[error("link i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Hardware: Send + Sync {
    /// Short name for logs ("serial", "sim")
    fn name(&self) -> &'static str;

    /// Send a command and wait for the device acknowledgment.
    /// Not cancellation safe with respect to the device: a dropped
    /// future may still have reached it.
    async fn send(&self, command: Command) -> Result<(), HardwareError>;
}
