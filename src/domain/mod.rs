//! Domain models - core race types and outbound events
//!
//! This module contains the canonical data types used throughout the system:
//! - `Race` - the race currently owned by the state machine
//! - `RaceResult` - immutable record of a finished race
//! - `LaneEvent` - normalized sensor gate signals
//! - `OutboundEvent` - events fanned out to observers

pub mod events;
pub mod race;
pub mod types;

// Re-export commonly used types at module level
pub use events::{DeviceStatus, OutboundEvent, SensorFlags};
pub use race::{decide_winner, Race, RaceResult};
pub use types::{Command, GateKind, Lane, LaneEvent, LaneEventKind, RaceId, RaceState, Winner};
