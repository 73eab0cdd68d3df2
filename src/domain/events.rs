//! Outbound events for observers
//!
//! Closed set of tagged variants, one per event kind. Serialized as
//! `{"event": "<name>", "data": {...}}`.

use crate::domain::race::RaceResult;
use crate::domain::types::{Lane, RaceId, RaceState, Winner};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

/// Per-sensor health flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SensorFlags {
    pub sensor1: bool,
    pub sensor2: bool,
}

/// Immutable device status snapshot, published by the sensor gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub sensors: SensorFlags,
    pub race_state: RaceState,
    pub updated_at: DateTime<Utc>,
}

impl DeviceStatus {
    pub fn all_healthy(&self) -> bool {
        self.sensors.sensor1 && self.sensors.sensor2
    }

    pub fn is_healthy(&self, lane: Lane) -> bool {
        match lane {
            Lane::Lane1 => self.sensors.sensor1,
            Lane::Lane2 => self.sensors.sensor2,
        }
    }

    /// `"sensor 1, sensor 2 faulted"` style summary; `None` when all healthy
    pub fn fault_summary(&self) -> Option<String> {
        let faulted: Vec<&str> = [("sensor 1", self.sensors.sensor1), ("sensor 2", self.sensors.sensor2)]
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect();
        if faulted.is_empty() {
            None
        } else {
            Some(format!("{} faulted", faulted.join(", ")))
        }
    }
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            sensors: SensorFlags { sensor1: true, sensor2: true },
            race_state: RaceState::Idle,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaceCompletedPayload {
    pub race_id: RaceId,
    pub car1_time_ms: Option<u64>,
    pub car2_time_ms: Option<u64>,
    pub winner: Winner,
}

impl From<&RaceResult> for RaceCompletedPayload {
    fn from(result: &RaceResult) -> Self {
        Self {
            race_id: result.race_id,
            car1_time_ms: result.car1_time_ms,
            car2_time_ms: result.car2_time_ms,
            winner: result.winner,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatusPayload {
    pub sensors: SensorFlags,
    pub race_state: RaceState,
}

impl From<&DeviceStatus> for DeviceStatusPayload {
    fn from(status: &DeviceStatus) -> Self {
        Self { sensors: status.sensors, race_state: status.race_state }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceErrorPayload {
    pub message: String,
}

/// Interim lane time while the other lane is still running
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaneFinishedPayload {
    pub race_id: RaceId,
    pub lane: u8,
    pub time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    RaceCompleted(RaceCompletedPayload),
    DeviceStatus(DeviceStatusPayload),
    DeviceError(DeviceErrorPayload),
    LaneFinished(LaneFinishedPayload),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::RaceCompleted(_) => "race_completed",
            OutboundEvent::DeviceStatus(_) => "device_status",
            OutboundEvent::DeviceError(_) => "device_error",
            OutboundEvent::LaneFinished(_) => "lane_finished",
        }
    }

    pub fn device_error(message: impl Into<String>) -> Self {
        OutboundEvent::DeviceError(DeviceErrorPayload { message: message.into() })
    }

    pub fn to_json(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                error!(event = %self.name(), error = %e, "event_serialize_failed");
                String::new()
            }
        }
    }

    /// The `data` object alone, as published on per-event topics
    pub fn data_json(&self) -> String {
        let data = match self {
            OutboundEvent::RaceCompleted(p) => serde_json::to_string(p),
            OutboundEvent::DeviceStatus(p) => serde_json::to_string(p),
            OutboundEvent::DeviceError(p) => serde_json::to_string(p),
            OutboundEvent::LaneFinished(p) => serde_json::to_string(p),
        };
        match data {
            Ok(json) => json,
            Err(e) => {
                error!(event = %self.name(), error = %e, "event_serialize_failed");
                String::new()
            }
        }
    }
}
