//! Services - race timing core
//!
//! - `sensor_gate` - Debounce and health of raw lane signals
//! - `clock` - Monotonic race clock
//! - `race_machine` - Race lifecycle state machine
//! - `controller` - Single owner task driving the state machine
//! - `dispatcher` - Command validation and hardware round-trip
//! - `broadcaster` - Fan-out of outbound events to observers

pub mod broadcaster;
pub mod clock;
pub mod controller;
pub mod dispatcher;
pub mod race_machine;
pub mod sensor_gate;

// Re-export commonly used types
pub use broadcaster::{Broadcaster, Envelope, SubscriberStatus, Subscription};
pub use clock::RaceClock;
pub use controller::{CommandRefused, RaceController, RaceInput, RaceSnapshot};
pub use dispatcher::{Ack, CommandDispatcher, CommandError};
pub use race_machine::{InvalidTransition, RaceMachine, RaceOutput};
pub use sensor_gate::{SensorGate, TriggerOutcome};
