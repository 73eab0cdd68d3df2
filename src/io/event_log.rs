//! Event log observer - writes every outbound event to the structured log

use crate::domain::events::OutboundEvent;
use crate::services::broadcaster::{Envelope, Subscription};
use tokio::sync::watch;
use tracing::{info, warn};

pub struct EventLogger {
    events: Subscription,
}

impl EventLogger {
    pub fn new(events: Subscription) -> Self {
        Self { events }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        while let Some(envelope) = self.events.try_recv() {
                            log_event(&envelope);
                        }
                        return;
                    }
                }
                envelope = self.events.recv() => match envelope {
                    Some(envelope) => log_event(&envelope),
                    None => return,
                },
            }

            if self.events.take_lagged() {
                warn!(dropped = %self.events.status().dropped, "event_log_lagging");
            }
        }
    }
}

fn log_event(envelope: &Envelope) {
    match envelope.event.as_ref() {
        OutboundEvent::RaceCompleted(p) => info!(
            seq = %envelope.seq,
            race_id = %p.race_id,
            car1_time_ms = ?p.car1_time_ms,
            car2_time_ms = ?p.car2_time_ms,
            winner = %p.winner.as_str(),
            "race_completed"
        ),
        OutboundEvent::DeviceError(p) => {
            warn!(seq = %envelope.seq, message = %p.message, "device_error")
        }
        other => info!(seq = %envelope.seq, event = %other.name(), data = %other.data_json(), "outbound_event"),
    }
}
