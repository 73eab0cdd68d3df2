//! Sensor gate - normalizes raw per-lane signals
//!
//! Callbacks are invoked from the hardware reader task and must never
//! block: debounce and health live in atomics, forwarding uses `try_send`
//! on the single ordered input queue. Health is also published as an
//! immutable `DeviceStatus` snapshot on a watch channel so readers never
//! observe a half-updated status.
//!
//! Triggers may be lost when the queue is full; faults may not. A fault
//! that finds the queue full is parked in a per-lane backlog and the
//! controller is woken through a `Notify` to collect it.

use crate::domain::events::{DeviceStatus, SensorFlags};
use crate::domain::types::{Command, GateKind, Lane, LaneEvent, LaneEventKind, RaceState};
use crate::infra::metrics::Metrics;
use crate::services::controller::RaceInput;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Marker for "no trigger accepted yet"
const NEVER: u64 = 0;

/// What happened to a raw trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Accepted,
    /// Within the debounce window of the previous accepted trigger
    Debounced,
    /// Input queue full, signal lost
    QueueFull,
}

struct GateInner {
    inputs: mpsc::Sender<RaceInput>,
    debounce_ns: u64,
    /// Reference for the atomic timestamps below
    epoch: Instant,
    /// Last accepted trigger per lane, ns since epoch plus one
    last_trigger_ns: [AtomicU64; 2],
    healthy: [AtomicBool; 2],
    race_state: AtomicU8,
    status_tx: watch::Sender<Arc<DeviceStatus>>,
    /// Faults that did not fit in the input queue, newest per lane
    fault_backlog: Mutex<[Option<LaneEvent>; 2]>,
    backlog_notify: Notify,
    metrics: Arc<Metrics>,
}

/// Cloneable handle; all clones share debounce and health state
#[derive(Clone)]
pub struct SensorGate {
    inner: Arc<GateInner>,
}

impl SensorGate {
    pub fn new(inputs: mpsc::Sender<RaceInput>, debounce: Duration, metrics: Arc<Metrics>) -> Self {
        let (status_tx, _) = watch::channel(Arc::new(DeviceStatus::default()));
        Self {
            inner: Arc::new(GateInner {
                inputs,
                debounce_ns: debounce.as_nanos() as u64,
                epoch: Instant::now(),
                last_trigger_ns: [AtomicU64::new(NEVER), AtomicU64::new(NEVER)],
                healthy: [AtomicBool::new(true), AtomicBool::new(true)],
                race_state: AtomicU8::new(RaceState::Idle.to_u8()),
                status_tx,
                fault_backlog: Mutex::new([None, None]),
                backlog_notify: Notify::new(),
                metrics,
            }),
        }
    }

    /// Raw trigger at a gate, observed at `at`
    pub fn on_trigger(&self, lane: Lane, gate: GateKind, at: Instant) -> TriggerOutcome {
        if !self.accept_trigger(lane, at) {
            self.inner.metrics.record_trigger_debounced();
            debug!(lane = %lane, gate = %gate.as_str(), "trigger_debounced");
            return TriggerOutcome::Debounced;
        }

        let event = LaneEvent { lane, timestamp: at, kind: LaneEventKind::Trigger(gate) };
        if self.forward(event) {
            self.inner.metrics.record_trigger_accepted();
            TriggerOutcome::Accepted
        } else {
            TriggerOutcome::QueueFull
        }
    }

    /// Lane reports it is ready for a race
    pub fn on_armed(&self, lane: Lane) {
        self.forward(LaneEvent { lane, timestamp: Instant::now(), kind: LaneEventKind::Armed });
    }

    /// Sensor error; marks the lane unhealthy
    pub fn on_fault(&self, lane: Lane, reason: &str) {
        self.inner.healthy[lane.index()].store(false, Ordering::Release);
        self.inner.metrics.record_sensor_fault();
        self.publish_status();
        warn!(lane = %lane, reason = %reason, "sensor_fault");

        let event = LaneEvent {
            lane,
            timestamp: Instant::now(),
            kind: LaneEventKind::Fault(reason.to_string()),
        };
        if self.inner.inputs.try_send(RaceInput::Lane(event.clone())).is_err() {
            self.inner.fault_backlog.lock()[lane.index()] = Some(event);
            self.inner.backlog_notify.notify_one();
            warn!(lane = %lane, "sensor_fault_deferred");
        }
    }

    /// Sensor healthy again; no-op if it was never faulted
    pub fn on_recovered(&self, lane: Lane) {
        let was_healthy = self.inner.healthy[lane.index()].swap(true, Ordering::AcqRel);
        if was_healthy {
            return;
        }
        self.publish_status();
        info!(lane = %lane, "sensor_recovered");

        self.forward(LaneEvent { lane, timestamp: Instant::now(), kind: LaneEventKind::Recovered });
    }

    /// Device acknowledged `command`; everything it sends afterwards is
    /// queued behind this marker
    pub fn on_command_acked(&self, command: Command, at: Instant) {
        if let Err(e) = self.inner.inputs.try_send(RaceInput::CommandAcked { command, at }) {
            self.inner.metrics.record_signal_dropped();
            warn!(command = %command, error = %e, "command_ack_dropped");
        }
    }

    /// Device-level error not tied to a lane
    pub fn on_device_error(&self, message: &str) {
        warn!(message = %message, "device_error");
        if let Err(e) = self.inner.inputs.try_send(RaceInput::DeviceError(message.to_string())) {
            self.inner.metrics.record_signal_dropped();
            warn!(error = %e, "sensor_signal_dropped");
        }
    }

    pub fn is_healthy(&self, lane: Lane) -> bool {
        self.inner.healthy[lane.index()].load(Ordering::Acquire)
    }

    /// Latest status snapshot
    pub fn status(&self) -> Arc<DeviceStatus> {
        self.inner.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Arc<DeviceStatus>> {
        self.inner.status_tx.subscribe()
    }

    /// Resolves once a fault has been parked in the backlog
    pub(crate) async fn fault_backlog_ready(&self) {
        self.inner.backlog_notify.notified().await
    }

    /// Drain parked faults, lane 1 first
    pub(crate) fn take_fault_backlog(&self) -> Vec<LaneEvent> {
        let mut backlog = self.inner.fault_backlog.lock();
        backlog.iter_mut().filter_map(Option::take).collect()
    }

    /// Mirror the lifecycle state into the status snapshot
    pub(crate) fn mirror_race_state(&self, state: RaceState) {
        self.inner.race_state.store(state.to_u8(), Ordering::Release);
        self.publish_status();
    }

    /// Per-lane debounce, shared by start and finish gates
    fn accept_trigger(&self, lane: Lane, at: Instant) -> bool {
        let now_ns = at.saturating_duration_since(self.inner.epoch).as_nanos() as u64 + 1;
        let slot = &self.inner.last_trigger_ns[lane.index()];
        let mut last = slot.load(Ordering::Acquire);
        loop {
            if last != NEVER && now_ns.saturating_sub(last) < self.inner.debounce_ns {
                return false;
            }
            match slot.compare_exchange_weak(last, now_ns, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => last = actual,
            }
        }
    }

    fn forward(&self, event: LaneEvent) -> bool {
        match self.inner.inputs.try_send(RaceInput::Lane(event)) {
            Ok(()) => true,
            Err(e) => {
                self.inner.metrics.record_signal_dropped();
                warn!(error = %e, "sensor_signal_dropped");
                false
            }
        }
    }

    fn publish_status(&self) {
        let inner = &self.inner;
        // Rebuilt under the watch lock so concurrent callers publish the latest flags
        inner.status_tx.send_modify(|status| {
            *status = Arc::new(DeviceStatus {
                sensors: SensorFlags {
                    sensor1: inner.healthy[0].load(Ordering::Acquire),
                    sensor2: inner.healthy[1].load(Ordering::Acquire),
                },
                race_state: RaceState::from_u8(inner.race_state.load(Ordering::Acquire)),
                updated_at: Utc::now(),
            });
        });
    }
}
