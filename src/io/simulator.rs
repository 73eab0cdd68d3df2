//! In-process timing device
//!
//! Behaves like the real device on the other end of the serial link:
//! acks each command after `ack_delay`, arms both lanes `arm_delay` after
//! a load, and after a start fires the start gates followed by each lane's
//! finish gate at its configured time (optionally with a contact bounce).
//! A lane time of `None` never finishes, which exercises the race timeout.

use crate::domain::types::{Command, GateKind, Lane};
use crate::infra::config::SimSettings;
use crate::io::hardware::{Hardware, HardwareError};
use crate::services::sensor_gate::SensorGate;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info};

/// Delay between the start ack and the start gate triggers
const START_GATE_DELAY: Duration = Duration::from_millis(1);
/// Second edge of a bouncing finish contact, inside the debounce window
const BOUNCE_GAP: Duration = Duration::from_millis(1);

pub struct SimulatedHardware {
    gate: SensorGate,
    settings: SimSettings,
    /// Scripted signals for the current command
    script: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedHardware {
    pub fn new(gate: SensorGate, settings: SimSettings) -> Self {
        info!(
            lane1_ms = ?settings.lane_times[0].map(|t| t.as_millis()),
            lane2_ms = ?settings.lane_times[1].map(|t| t.as_millis()),
            bounce = %settings.bounce,
            "simulator_ready"
        );
        Self { gate, settings, script: Mutex::new(None) }
    }

    fn replace_script(&self, script: Option<JoinHandle<()>>) {
        let previous = std::mem::replace(&mut *self.script.lock(), script);
        if let Some(handle) = previous {
            handle.abort();
        }
    }

    fn arm_script(&self) -> JoinHandle<()> {
        let gate = self.gate.clone();
        let delay = self.settings.arm_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            for lane in Lane::ALL {
                gate.on_armed(lane);
            }
            debug!("simulator_armed");
        })
    }

    fn race_script(&self) -> JoinHandle<()> {
        let gate = self.gate.clone();
        let timeline = race_timeline(&self.settings);
        let base = Instant::now();
        tokio::spawn(async move {
            for (offset, lane, kind) in timeline {
                sleep_until(base + offset).await;
                gate.on_trigger(lane, kind, Instant::now());
            }
            debug!("simulator_race_done");
        })
    }
}

/// Trigger schedule relative to the start acknowledgment, in time order
pub fn race_timeline(settings: &SimSettings) -> Vec<(Duration, Lane, GateKind)> {
    let mut timeline = Vec::with_capacity(6);
    for lane in Lane::ALL {
        timeline.push((START_GATE_DELAY, lane, GateKind::Start));
        if let Some(time) = settings.lane_times[lane.index()] {
            let finish = START_GATE_DELAY + time;
            timeline.push((finish, lane, GateKind::Finish));
            if settings.bounce {
                timeline.push((finish + BOUNCE_GAP, lane, GateKind::Finish));
            }
        }
    }
    timeline.sort_by_key(|(offset, _, _)| *offset);
    timeline
}

#[async_trait]
impl Hardware for SimulatedHardware {
    fn name(&self) -> &'static str {
        "sim"
    }

    async fn send(&self, command: Command) -> Result<(), HardwareError> {
        sleep(self.settings.ack_delay).await;
        self.gate.on_command_acked(command, Instant::now());
        let script = match command {
            Command::Load => Some(self.arm_script()),
            Command::Start => Some(self.race_script()),
            Command::Reset => None,
        };
        self.replace_script(script);
        debug!(command = %command, "simulator_ack");
        Ok(())
    }
}
