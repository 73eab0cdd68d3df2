//! Serial link to the timing device
//!
//! Protocol: newline-delimited JSON over a serial port (default 115200 8N1).
//!
//! Host to device:
//! - `{"cmd":"load"}` - prepare a race, device arms both lanes
//! - `{"cmd":"start_race"}` - release the start gate
//! - `{"cmd":"reset_timer"}` - abort and return to idle
//!
//! Device to host:
//! - `{"type":"ack","cmd":..}` / `{"type":"nack","cmd":..,"message":..}`
//! - `{"type":"trigger","lane":1,"gate":"finish"}`
//! - `{"type":"armed","lane":1}`
//! - `{"type":"fault","lane":2,"message":..}` / `{"type":"sensor_ok","lane":2}`
//! - `{"type":"status","sensor1_ok":true,"sensor2_ok":false}`
//! - `{"type":"error","message":..}`
//!
//! Triggers are timestamped when the line is read, so the reader task
//! does nothing but parse and hand off to the sensor gate. An ack is
//! handed to the gate as well, before the waiting sender is woken, so the
//! command commits ahead of whatever the device sends next.

use crate::domain::types::{Command, GateKind, Lane};
use crate::io::hardware::{Hardware, HardwareError};
use crate::services::sensor_gate::SensorGate;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

/// Messages sent by the device
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    Ack {
        cmd: String,
    },
    Nack {
        cmd: String,
        #[serde(default)]
        message: String,
    },
    Trigger {
        lane: u8,
        gate: GateKind,
    },
    Armed {
        lane: u8,
    },
    Fault {
        lane: u8,
        #[serde(default)]
        message: String,
    },
    SensorOk {
        lane: u8,
    },
    Status {
        sensor1_ok: bool,
        sensor2_ok: bool,
    },
    Error {
        message: String,
    },
}

pub fn parse_line(line: &str) -> Result<DeviceMessage, serde_json::Error> {
    serde_json::from_str(line.trim())
}

/// Device-side command name
pub fn wire_name(command: Command) -> &'static str {
    match command {
        Command::Load => "load",
        Command::Start => "start_race",
        Command::Reset => "reset_timer",
    }
}

/// Newline-terminated command frame
pub fn command_frame(command: Command) -> String {
    format!("{{\"cmd\":\"{}\"}}\n", wire_name(command))
}

struct Pending {
    command: Command,
    reply: oneshot::Sender<Result<(), HardwareError>>,
}

/// Command awaiting its ack, shared with the reader task
#[derive(Clone, Default)]
struct PendingSlot(Arc<Mutex<Option<Pending>>>);

impl PendingSlot {
    fn set(&self, command: Command) -> oneshot::Receiver<Result<(), HardwareError>> {
        let (reply, rx) = oneshot::channel();
        *self.0.lock() = Some(Pending { command, reply });
        rx
    }

    /// Pending command answered by `cmd`, if its sender is still waiting
    fn take_matching(&self, cmd: &str) -> Option<Pending> {
        let mut slot = self.0.lock();
        match slot.take() {
            Some(pending) if wire_name(pending.command) == cmd => {
                if pending.reply.is_closed() {
                    debug!(cmd = %cmd, "serial_ack_after_timeout");
                    return None;
                }
                Some(pending)
            }
            Some(pending) => {
                warn!(expected = %wire_name(pending.command), got = %cmd, "serial_ack_mismatch");
                *slot = Some(pending);
                None
            }
            None => {
                debug!(cmd = %cmd, "serial_unexpected_ack");
                None
            }
        }
    }

    fn fail_all(&self) {
        if let Some(pending) = self.0.lock().take() {
            let _ = pending.reply.send(Err(HardwareError::Disconnected));
        }
    }
}

pub struct SerialLink<W = WriteHalf<SerialStream>> {
    writer: tokio::sync::Mutex<W>,
    pending: PendingSlot,
    connected: Arc<AtomicBool>,
}

impl SerialLink {
    /// Open the port and spawn the reader task
    pub fn open(
        device: &str,
        baud: u32,
        gate: SensorGate,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, HardwareError> {
        let port = tokio_serial::new(device, baud)
            .open_native_async()
            .map_err(|e| HardwareError::Io(e.into()))?;
        info!(device = %device, baud = %baud, "serial_port_opened");
        Ok(Self::from_stream(port, gate, shutdown))
    }
}

impl<S> SerialLink<WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap any byte stream speaking the device protocol
    pub fn from_stream(stream: S, gate: SensorGate, shutdown: watch::Receiver<bool>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let pending = PendingSlot::default();
        let connected = Arc::new(AtomicBool::new(true));
        tokio::spawn(run_reader(reader, gate, pending.clone(), connected.clone(), shutdown));
        Self { writer: tokio::sync::Mutex::new(writer), pending, connected }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Hardware for SerialLink<W> {
    fn name(&self) -> &'static str {
        "serial"
    }

    async fn send(&self, command: Command) -> Result<(), HardwareError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(HardwareError::Disconnected);
        }
        let ack = self.pending.set(command);
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(command_frame(command).as_bytes()).await?;
            writer.flush().await?;
        }
        debug!(cmd = %wire_name(command), "serial_command_sent");
        ack.await.map_err(|_| HardwareError::Disconnected)?
    }
}

async fn run_reader<R: AsyncRead + Unpin>(
    reader: R,
    gate: SensorGate,
    pending: PendingSlot,
    connected: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("serial_reader_shutdown");
                    return;
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let at = Instant::now();
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_line(&line) {
                        Ok(message) => route(message, at, &gate, &pending),
                        Err(e) => warn!(error = %e, line = %line, "serial_parse_failed"),
                    }
                }
                Ok(None) => {
                    error!("serial_link_closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "serial_read_error");
                    break;
                }
            }
        }
    }

    connected.store(false, Ordering::Release);
    pending.fail_all();
    for lane in Lane::ALL {
        gate.on_fault(lane, "serial link lost");
    }
}

fn lane_of(n: u8) -> Option<Lane> {
    let lane = Lane::from_number(n);
    if lane.is_none() {
        warn!(lane = %n, "serial_unknown_lane");
    }
    lane
}

fn route(message: DeviceMessage, at: Instant, gate: &SensorGate, pending: &PendingSlot) {
    match message {
        DeviceMessage::Ack { cmd } => {
            if let Some(acked) = pending.take_matching(&cmd) {
                gate.on_command_acked(acked.command, at);
                let _ = acked.reply.send(Ok(()));
            }
        }
        DeviceMessage::Nack { cmd, message } => {
            if let Some(refused) = pending.take_matching(&cmd) {
                let command = refused.command;
                let _ = refused.reply.send(Err(HardwareError::Rejected { command, reason: message }));
            }
        }
        DeviceMessage::Trigger { lane, gate: kind } => {
            if let Some(lane) = lane_of(lane) {
                gate.on_trigger(lane, kind, at);
            }
        }
        DeviceMessage::Armed { lane } => {
            if let Some(lane) = lane_of(lane) {
                gate.on_armed(lane);
            }
        }
        DeviceMessage::Fault { lane, message } => {
            if let Some(lane) = lane_of(lane) {
                gate.on_fault(lane, &message);
            }
        }
        DeviceMessage::SensorOk { lane } => {
            if let Some(lane) = lane_of(lane) {
                gate.on_recovered(lane);
            }
        }
        DeviceMessage::Status { sensor1_ok, sensor2_ok } => {
            for (lane, ok) in [(Lane::Lane1, sensor1_ok), (Lane::Lane2, sensor2_ok)] {
                if ok {
                    gate.on_recovered(lane);
                } else if gate.is_healthy(lane) {
                    gate.on_fault(lane, "reported by status");
                }
            }
        }
        DeviceMessage::Error { message } => gate.on_device_error(&message),
    }
}
