//! Command dispatcher - validates and forwards commands to the hardware
//!
//! Commands are serialized: a second caller waits until the first one has
//! been acknowledged or has timed out. For `load` and `start` the flow is
//!
//! 1. sensor health check
//! 2. legality check against the race machine (no state change)
//! 3. hardware round-trip bounded by the ack timeout
//! 4. state change applied at the acknowledgment instant, after a second
//!    health check
//!
//! so a timeout or hardware error leaves the race state untouched. A link
//! that queues its acks through the sensor gate has the change committed
//! by the controller when the ack marker is dequeued; step 4 then only
//! collects the outcome.
//! `reset` is applied first and then sent best-effort, so the race core
//! can always be recovered even with the device unreachable.

use crate::domain::types::{Command, RaceId, RaceState};
use crate::infra::metrics::Metrics;
use crate::io::hardware::Hardware;
use crate::services::controller::{
    CommandPhase, CommandRefused, CommandReply, CommandRequest, RaceInput,
};
use crate::services::race_machine::InvalidTransition;
use crate::services::sensor_gate::SensorGate;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    InvalidState(#[from] InvalidTransition),
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),
    #[error("hardware did not acknowledge {command} within {}ms", .timeout.as_millis())]
    Timeout { command: Command, timeout: Duration },
    #[error("race controller unavailable")]
    ControllerUnavailable,
}

/// Successful command outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub command: Command,
    pub state: RaceState,
    pub race_id: Option<RaceId>,
    /// Hardware round-trip; zero when the device was not reached
    pub ack_latency: Duration,
}

pub struct CommandDispatcher {
    inputs: mpsc::Sender<RaceInput>,
    hardware: Arc<dyn Hardware>,
    gate: SensorGate,
    ack_timeout: Duration,
    in_flight: Mutex<()>,
    metrics: Arc<Metrics>,
}

impl CommandDispatcher {
    pub fn new(
        inputs: mpsc::Sender<RaceInput>,
        hardware: Arc<dyn Hardware>,
        gate: SensorGate,
        ack_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { inputs, hardware, gate, ack_timeout, in_flight: Mutex::new(()), metrics }
    }

    pub async fn dispatch(&self, command: Command) -> Result<Ack, CommandError> {
        let _guard = self.in_flight.lock().await;
        info!(command = %command, hardware = %self.hardware.name(), "command_received");

        let result = match command {
            Command::Reset => self.reset().await,
            Command::Load | Command::Start => self.guarded(command).await,
        };

        match &result {
            Ok(ack) => {
                self.metrics.record_command_ok();
                info!(
                    command = %command,
                    state = %ack.state,
                    race_id = ?ack.race_id.map(|id| id.0),
                    ack_latency_us = %ack.ack_latency.as_micros(),
                    "command_ok"
                );
            }
            Err(CommandError::Timeout { .. }) => {
                self.metrics.record_command_timeout();
                warn!(command = %command, timeout_ms = %self.ack_timeout.as_millis(), "command_timeout");
            }
            Err(e) => {
                self.metrics.record_command_rejected();
                warn!(command = %command, error = %e, "command_rejected");
            }
        }
        result
    }

    async fn guarded(&self, command: Command) -> Result<Ack, CommandError> {
        if let Some(faulted) = self.gate.status().fault_summary() {
            return Err(CommandError::HardwareUnavailable(faulted));
        }

        self.request(command, CommandPhase::Validate, Instant::now()).await?;

        let sent = Instant::now();
        let failure = match timeout(self.ack_timeout, self.hardware.send(command)).await {
            Err(_) => Some(CommandError::Timeout { command, timeout: self.ack_timeout }),
            Ok(Err(e)) => Some(CommandError::HardwareUnavailable(e.to_string())),
            Ok(Ok(())) => None,
        };
        if let Some(err) = failure {
            self.request(command, CommandPhase::Abandon, Instant::now()).await?;
            return Err(err);
        }
        let acked = Instant::now();
        let ack_latency = acked.saturating_duration_since(sent);
        self.metrics.record_ack_latency(ack_latency.as_micros() as u64);

        let reply = self.request(command, CommandPhase::Apply, acked).await?;
        Ok(Ack { command, state: reply.state, race_id: reply.race_id, ack_latency })
    }

    async fn reset(&self) -> Result<Ack, CommandError> {
        let reply = self.request(Command::Reset, CommandPhase::Apply, Instant::now()).await?;

        let sent = Instant::now();
        let ack_latency = match timeout(self.ack_timeout, self.hardware.send(Command::Reset)).await {
            Ok(Ok(())) => {
                let latency = sent.elapsed();
                self.metrics.record_ack_latency(latency.as_micros() as u64);
                latency
            }
            Ok(Err(e)) => {
                warn!(error = %e, "reset_not_delivered");
                Duration::ZERO
            }
            Err(_) => {
                warn!(timeout_ms = %self.ack_timeout.as_millis(), "reset_not_acknowledged");
                Duration::ZERO
            }
        };
        Ok(Ack { command: Command::Reset, state: reply.state, race_id: reply.race_id, ack_latency })
    }

    async fn request(
        &self,
        command: Command,
        phase: CommandPhase,
        at: Instant,
    ) -> Result<CommandReply, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.inputs
            .send(RaceInput::Command(CommandRequest { command, phase, at, reply }))
            .await
            .map_err(|_| CommandError::ControllerUnavailable)?;
        match rx.await.map_err(|_| CommandError::ControllerUnavailable)? {
            Ok(reply) => Ok(reply),
            Err(CommandRefused::InvalidState(e)) => Err(CommandError::InvalidState(e)),
            Err(CommandRefused::SensorFault(faulted)) => Err(CommandError::HardwareUnavailable(faulted)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Lane;
    use crate::infra::config::TimingSettings;
    use crate::io::hardware::HardwareError;
    use crate::services::broadcaster::Broadcaster;
    use crate::services::controller::RaceController;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use tokio::sync::watch;

    /// Scripted device: acks after `delay`, records what it received
    struct FakeHardware {
        delay: Duration,
        fail: bool,
        stall_reset: SyncMutex<bool>,
        /// Lane 1 faults while a start is in flight
        fault_on_start: SyncMutex<Option<SensorGate>>,
        sent: SyncMutex<Vec<Command>>,
    }

    impl FakeHardware {
        fn new(delay: Duration, fail: bool) -> Self {
            Self {
                delay,
                fail,
                stall_reset: SyncMutex::new(false),
                fault_on_start: SyncMutex::new(None),
                sent: SyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Hardware for FakeHardware {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn send(&self, command: Command) -> Result<(), HardwareError> {
            self.sent.lock().push(command);
            if command == Command::Reset && *self.stall_reset.lock() {
                std::future::pending::<()>().await;
            }
            if command == Command::Start {
                if let Some(gate) = self.fault_on_start.lock().as_ref() {
                    gate.on_fault(Lane::Lane1, "beam blocked");
                }
            }
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(HardwareError::Disconnected);
            }
            Ok(())
        }
    }

    struct Setup {
        dispatcher: CommandDispatcher,
        gate: SensorGate,
        hardware: Arc<FakeHardware>,
        metrics: Arc<Metrics>,
        _shutdown: watch::Sender<bool>,
    }

    fn setup(delay: Duration, fail: bool) -> Setup {
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = mpsc::channel(64);
        let gate = SensorGate::new(tx.clone(), Duration::from_millis(5), metrics.clone());
        let broadcaster = Broadcaster::new(16, metrics.clone());
        let controller =
            RaceController::new(TimingSettings::default(), gate.clone(), broadcaster, metrics.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(controller.run(rx, shutdown_rx));

        let hardware = Arc::new(FakeHardware::new(delay, fail));
        let dispatcher = CommandDispatcher::new(
            tx,
            hardware.clone(),
            gate.clone(),
            Duration::from_secs(2),
            metrics.clone(),
        );
        Setup { dispatcher, gate, hardware, metrics, _shutdown: shutdown_tx }
    }

    async fn arm(gate: &SensorGate) {
        gate.on_armed(Lane::Lane1);
        gate.on_armed(Lane::Lane2);
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_then_start() {
        let s = setup(Duration::from_millis(5), false);

        let ack = s.dispatcher.dispatch(Command::Load).await.unwrap();
        assert_eq!(ack.state, RaceState::Loaded);
        assert_eq!(ack.race_id, Some(RaceId(1)));
        assert!(ack.ack_latency >= Duration::from_millis(5));

        arm(&s.gate).await;
        let ack = s.dispatcher.dispatch(Command::Start).await.unwrap();
        assert_eq!(ack.state, RaceState::Racing);
        assert_eq!(*s.hardware.sent.lock(), vec![Command::Load, Command::Start]);
        assert_eq!(s.metrics.report().commands_ok, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_command_never_reaches_hardware() {
        let s = setup(Duration::from_millis(5), false);
        let err = s.dispatcher.dispatch(Command::Start).await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::InvalidState(InvalidTransition { state: RaceState::Idle, command: Command::Start })
        ));
        assert!(s.hardware.sent.lock().is_empty());
        assert_eq!(s.metrics.report().commands_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout_leaves_state_unchanged() {
        let s = setup(Duration::from_secs(5), false);
        let err = s.dispatcher.dispatch(Command::Load).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout { command: Command::Load, .. }));
        assert_eq!(err.to_string(), "hardware did not acknowledge load within 2000ms");
        assert_eq!(s.gate.status().race_state, RaceState::Idle);
        assert_eq!(s.metrics.report().command_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_faulted_sensor_blocks_load() {
        let s = setup(Duration::from_millis(5), false);
        s.gate.on_fault(Lane::Lane2, "disconnected");
        let err = s.dispatcher.dispatch(Command::Load).await.unwrap_err();
        assert_eq!(err.to_string(), "hardware unavailable: sensor 2 faulted");
        assert!(s.hardware.sent.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_while_awaiting_start_ack() {
        let s = setup(Duration::from_millis(5), false);
        s.dispatcher.dispatch(Command::Load).await.unwrap();
        arm(&s.gate).await;
        *s.hardware.fault_on_start.lock() = Some(s.gate.clone());

        let err = s.dispatcher.dispatch(Command::Start).await.unwrap_err();
        assert_eq!(err.to_string(), "hardware unavailable: sensor 1 faulted");
        assert_eq!(s.gate.status().race_state, RaceState::Ready);
        assert_eq!(*s.hardware.sent.lock(), vec![Command::Load, Command::Start]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hardware_error_is_reported() {
        let s = setup(Duration::from_millis(1), true);
        let err = s.dispatcher.dispatch(Command::Load).await.unwrap_err();
        assert!(matches!(err, CommandError::HardwareUnavailable(_)));
        assert_eq!(s.gate.status().race_state, RaceState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_succeeds_with_unreachable_device() {
        let s = setup(Duration::from_millis(5), false);
        s.dispatcher.dispatch(Command::Load).await.unwrap();
        *s.hardware.stall_reset.lock() = true;

        let ack = s.dispatcher.dispatch(Command::Reset).await.unwrap();
        assert_eq!(ack.state, RaceState::Idle);
        assert_eq!(ack.race_id, None);
        assert_eq!(ack.ack_latency, Duration::ZERO);
        assert_eq!(s.gate.status().race_state, RaceState::Idle);
        assert_eq!(*s.hardware.sent.lock(), vec![Command::Load, Command::Reset]);
        assert_eq!(s.metrics.report().command_timeouts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_gone() {
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let gate = SensorGate::new(tx.clone(), Duration::from_millis(5), metrics.clone());
        let hardware = Arc::new(FakeHardware::new(Duration::ZERO, false));
        let dispatcher = CommandDispatcher::new(tx, hardware, gate, Duration::from_secs(2), metrics);
        assert!(matches!(
            dispatcher.dispatch(Command::Load).await,
            Err(CommandError::ControllerUnavailable)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_are_serialized() {
        let s = Arc::new(setup(Duration::from_millis(50), false));
        let first = {
            let s = s.clone();
            tokio::spawn(async move { s.dispatcher.dispatch(Command::Load).await })
        };
        tokio::task::yield_now().await;
        // Second load waits for the first, then is refused in Loaded
        let second = s.dispatcher.dispatch(Command::Load).await;
        assert!(first.await.unwrap().is_ok());
        assert!(matches!(second, Err(CommandError::InvalidState(_))));
        assert_eq!(s.hardware.sent.lock().len(), 1);
    }
}
