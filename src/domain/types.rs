//! Shared types for the race timer

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Newtype wrapper for race IDs (monotonic per process)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RaceId(pub u64);

impl std::fmt::Display for RaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the two timing lanes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Lane1,
    Lane2,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Lane1, Lane::Lane2];

    /// Array index for per-lane storage
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Lane::Lane1 => 0,
            Lane::Lane2 => 1,
        }
    }

    /// Lane number as used on the wire (1 or 2)
    #[inline]
    pub fn number(self) -> u8 {
        self.index() as u8 + 1
    }

    pub fn from_number(n: u8) -> Option<Lane> {
        match n {
            1 => Some(Lane::Lane1),
            2 => Some(Lane::Lane2),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Lane1 => "lane1",
            Lane::Lane2 => "lane2",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sensor position on a lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    Start,
    Finish,
}

impl GateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::Start => "start",
            GateKind::Finish => "finish",
        }
    }
}

/// Race lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RaceState {
    #[default]
    Idle,
    Loaded,
    Ready,
    Racing,
    Finished,
    Faulted,
}

impl RaceState {
    /// Wire name, matching the `device_status.race_state` values
    pub fn as_str(&self) -> &'static str {
        match self {
            RaceState::Idle => "idle",
            RaceState::Loaded => "loaded",
            RaceState::Ready => "ready",
            RaceState::Racing => "racing",
            RaceState::Finished => "finished",
            RaceState::Faulted => "error",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            RaceState::Idle => 0,
            RaceState::Loaded => 1,
            RaceState::Ready => 2,
            RaceState::Racing => 3,
            RaceState::Finished => 4,
            RaceState::Faulted => 5,
        }
    }

    pub(crate) fn from_u8(v: u8) -> RaceState {
        match v {
            1 => RaceState::Loaded,
            2 => RaceState::Ready,
            3 => RaceState::Racing,
            4 => RaceState::Finished,
            5 => RaceState::Faulted,
            _ => RaceState::Idle,
        }
    }
}

impl Serialize for RaceState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl std::fmt::Display for RaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Race outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Winner {
    Lane1,
    Lane2,
    Tie,
    #[default]
    Unresolved,
}

impl Winner {
    /// Wire name used by `race_completed`
    pub fn as_str(&self) -> &'static str {
        match self {
            Winner::Lane1 => "car1",
            Winner::Lane2 => "car2",
            Winner::Tie => "tie",
            Winner::Unresolved => "unresolved",
        }
    }
}

impl Serialize for Winner {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// External command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Load,
    Start,
    Reset,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Load => "load",
            Command::Start => "start",
            Command::Reset => "reset",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command: {0}")]
pub struct UnknownCommand(pub String);

impl std::str::FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "load" => Ok(Command::Load),
            "start" => Ok(Command::Start),
            "reset" => Ok(Command::Reset),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

/// Normalized signal from the sensor gate
#[derive(Debug, Clone, PartialEq)]
pub enum LaneEventKind {
    /// Lane reports it is ready for a race
    Armed,
    /// Debounced trigger at a gate
    Trigger(GateKind),
    /// Sensor reported an error
    Fault(String),
    /// Sensor healthy again
    Recovered,
}

/// Sensor gate output consumed by the race state machine
#[derive(Debug, Clone, PartialEq)]
pub struct LaneEvent {
    pub lane: Lane,
    /// Monotonic instant the signal was observed
    pub timestamp: Instant,
    pub kind: LaneEventKind,
}

/// A recorded gate trigger, relative to race start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaneReading {
    pub lane: Lane,
    #[serde(serialize_with = "serialize_duration_us")]
    pub at: Duration,
    pub source: GateKind,
}

/// Milliseconds with sub-millisecond precision dropped
#[inline]
pub fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

fn serialize_duration_us<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_micros() as u64)
}
