//! Race controller - single owner of the race state machine
//!
//! Consumes the ordered input queue (sensor signals and command requests),
//! drives the race machine, and publishes every committed output to the
//! broadcaster in the order it was produced. Also fires the race timeout.
//!
//! A `load` or `start` is committed where its device acknowledgment sits
//! in the queue: the hardware side enqueues a `CommandAcked` marker ahead
//! of anything the device reports after the ack. Hardware that cannot
//! mark its acks is committed by the dispatcher's `Apply` request instead.

use crate::domain::events::{DeviceStatusPayload, LaneFinishedPayload, OutboundEvent};
use crate::domain::race::{RaceResult, RaceView};
use crate::domain::types::{duration_ms, Command, LaneEvent, LaneEventKind, RaceId, RaceState};
use crate::infra::config::TimingSettings;
use crate::infra::metrics::Metrics;
use crate::services::broadcaster::Broadcaster;
use crate::services::race_machine::{InvalidTransition, RaceMachine, RaceOutput};
use crate::services::sensor_gate::SensorGate;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Two-phase command handling: legality check before the hardware
/// round-trip, state change after the acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPhase {
    Validate,
    Apply,
    /// Hardware round-trip failed; forget the validated command
    Abandon,
}

/// Why the controller refused a command
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandRefused {
    #[error(transparent)]
    InvalidState(#[from] InvalidTransition),
    /// A sensor faulted between the health check and the acknowledgment
    #[error("{0}")]
    SensorFault(String),
}

/// Validated command between the hardware send and its commit
#[derive(Debug)]
enum Pending {
    Sent(Command),
    /// Ack marker already seen and handled
    Committed(Command, Result<(), CommandRefused>),
}

/// State after a command was checked or applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandReply {
    pub state: RaceState,
    pub race_id: Option<RaceId>,
}

#[derive(Debug)]
pub struct CommandRequest {
    pub command: Command,
    pub phase: CommandPhase,
    /// Instant the hardware acknowledged (time zero for `Start`)
    pub at: Instant,
    pub reply: oneshot::Sender<Result<CommandReply, CommandRefused>>,
}

/// Everything the controller consumes, in arrival order
#[derive(Debug)]
pub enum RaceInput {
    Lane(LaneEvent),
    Command(CommandRequest),
    /// Device acknowledged a command, queued in line with its signals
    CommandAcked { command: Command, at: Instant },
    /// Device error not tied to a lane
    DeviceError(String),
}

/// Read-only view for status queries
#[derive(Debug, Clone, Default, Serialize)]
pub struct RaceSnapshot {
    pub state: RaceState,
    pub race: Option<RaceView>,
    pub history: Vec<RaceResult>,
}

pub struct RaceController {
    machine: RaceMachine,
    gate: SensorGate,
    broadcaster: Broadcaster,
    metrics: Arc<Metrics>,
    snapshot_tx: watch::Sender<Arc<RaceSnapshot>>,
    pending: Option<Pending>,
}

impl RaceController {
    pub fn new(
        settings: TimingSettings,
        gate: SensorGate,
        broadcaster: Broadcaster,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(RaceSnapshot::default()));
        Self {
            machine: RaceMachine::new(settings),
            gate,
            broadcaster,
            metrics,
            snapshot_tx,
            pending: None,
        }
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<Arc<RaceSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn state(&self) -> RaceState {
        self.machine.state()
    }

    /// Process inputs until the queue closes or shutdown is signalled
    pub async fn run(mut self, mut inputs: mpsc::Receiver<RaceInput>, mut shutdown: watch::Receiver<bool>) {
        info!(
            debounce_ms = %self.machine.settings().debounce.as_millis(),
            tie_tolerance_ms = %self.machine.settings().tie_tolerance.as_millis(),
            max_race_ms = %self.machine.settings().max_race.as_millis(),
            "race_controller_started"
        );

        loop {
            let deadline = self.machine.race_deadline();
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("race_controller_shutdown");
                        break;
                    }
                }
                _ = self.gate.fault_backlog_ready() => {
                    for event in self.gate.take_fault_backlog() {
                        self.handle_lane(event);
                    }
                }
                input = inputs.recv() => match input {
                    Some(input) => self.handle_input(input),
                    None => {
                        info!("race_controller_inputs_closed");
                        break;
                    }
                },
                _ = sleep_until_opt(deadline) => {
                    let outputs = self.machine.expire(Instant::now());
                    self.publish(outputs);
                }
            }
        }
    }

    /// Apply one input and publish what it committed
    pub fn handle_input(&mut self, input: RaceInput) {
        match input {
            RaceInput::Lane(event) => self.handle_lane(event),
            RaceInput::Command(request) => self.handle_command(request),
            RaceInput::CommandAcked { command, at } => self.handle_ack(command, at),
            RaceInput::DeviceError(message) => {
                self.broadcaster.publish(OutboundEvent::device_error(message));
            }
        }
    }

    fn handle_lane(&mut self, event: LaneEvent) {
        // A reading captured after the deadline must not count
        let mut outputs = self.machine.expire(event.timestamp);
        outputs.extend(self.machine.handle_lane_event(&event));

        match &event.kind {
            LaneEventKind::Fault(reason) => {
                self.broadcaster.publish(OutboundEvent::device_error(format!(
                    "sensor {} fault: {}",
                    event.lane.number(),
                    reason
                )));
                if !has_state_change(&outputs) {
                    self.publish_status(self.machine.state());
                }
            }
            LaneEventKind::Recovered => {
                if !has_state_change(&outputs) {
                    self.publish_status(self.machine.state());
                }
            }
            LaneEventKind::Armed | LaneEventKind::Trigger(_) => {}
        }

        self.publish(outputs);
        let latency = Instant::now().saturating_duration_since(event.timestamp);
        self.metrics.record_input_processed(latency.as_micros() as u64);
    }

    fn handle_command(&mut self, request: CommandRequest) {
        let CommandRequest { command, phase, at, reply } = request;
        let result = match phase {
            CommandPhase::Validate => self.machine.check(command).map_err(CommandRefused::from).map(|()| {
                if command != Command::Reset {
                    self.pending = Some(Pending::Sent(command));
                }
            }),
            CommandPhase::Apply => match self.pending.take() {
                Some(Pending::Committed(committed, outcome)) if committed == command => outcome,
                _ => self.commit(command, at),
            },
            CommandPhase::Abandon => {
                if let Some(Pending::Committed(committed, Ok(()))) = self.pending.take() {
                    warn!(command = %committed, "command_committed_before_failure");
                }
                Ok(())
            }
        };
        if let Err(e) = &result {
            debug!(command = %command, error = %e, "command_refused");
        }

        let reply_value = result.map(|_| CommandReply {
            state: self.machine.state(),
            race_id: self.machine.current().map(|race| race.id),
        });
        // Requester may have given up; the state change already happened
        let _ = reply.send(reply_value);
    }

    fn handle_ack(&mut self, command: Command, at: Instant) {
        match self.pending.take() {
            Some(Pending::Sent(sent)) if sent == command => {
                let outcome = self.commit(command, at);
                self.pending = Some(Pending::Committed(command, outcome));
            }
            other => {
                self.pending = other;
                debug!(command = %command, "ack_without_pending_command");
            }
        }
    }

    /// Apply a command to the machine. Sensor health is checked again at
    /// this point, since a fault may have arrived during the round-trip.
    fn commit(&mut self, command: Command, at: Instant) -> Result<(), CommandRefused> {
        if command != Command::Reset {
            if let Some(faulted) = self.gate.status().fault_summary() {
                return Err(CommandRefused::SensorFault(faulted));
            }
        }
        let outputs = self.machine.apply(command, at)?;
        if command == Command::Start {
            self.metrics.record_race_started();
        }
        self.publish(outputs);
        Ok(())
    }

    fn publish(&mut self, outputs: Vec<RaceOutput>) {
        if outputs.is_empty() {
            return;
        }
        let mut changed = false;
        for output in outputs {
            match output {
                RaceOutput::StateChanged { race_id, from, to } => {
                    changed = true;
                    info!(race_id = ?race_id.map(|id| id.0), from = %from, to = %to, "race_state");
                    if to == RaceState::Faulted {
                        self.metrics.record_race_faulted();
                    }
                    self.gate.mirror_race_state(to);
                    self.publish_status(to);
                }
                RaceOutput::LaneFinished { race_id, lane, time } => {
                    changed = true;
                    self.broadcaster.publish(OutboundEvent::LaneFinished(LaneFinishedPayload {
                        race_id,
                        lane: lane.number(),
                        time_ms: duration_ms(time),
                    }));
                }
                RaceOutput::Completed(result) => {
                    changed = true;
                    self.metrics.record_race_finished();
                    self.broadcaster.publish(OutboundEvent::RaceCompleted((&result).into()));
                }
                RaceOutput::TimedOut { .. } => {
                    self.metrics.record_race_timed_out();
                }
                RaceOutput::Ignored { lane, reason } => {
                    self.metrics.record_reading_rejected();
                    debug!(lane = %lane, reason = %reason.as_str(), "reading_ignored");
                }
            }
        }
        if changed {
            self.refresh_snapshot();
        }
    }

    fn publish_status(&self, race_state: RaceState) {
        let sensors = self.gate.status().sensors;
        self.broadcaster
            .publish(OutboundEvent::DeviceStatus(DeviceStatusPayload { sensors, race_state }));
    }

    fn refresh_snapshot(&self) {
        let snapshot = RaceSnapshot {
            state: self.machine.state(),
            race: self.machine.current().map(RaceView::from),
            history: self.machine.history().iter().cloned().collect(),
        };
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}

fn has_state_change(outputs: &[RaceOutput]) -> bool {
    outputs.iter().any(|o| matches!(o, RaceOutput::StateChanged { .. }))
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
