//! MQTT publisher for outbound race events
//!
//! Subscribes to the broadcaster like any other observer and republishes
//! each event's `data` object on `{prefix}/{event}`:
//! - race/race_completed - finished races (QoS 1)
//! - race/lane_finished - interim lane times (QoS 0)
//! - race/device_status - health and state changes (QoS 0, retained)
//! - race/device_error - faults (QoS 1)

use crate::domain::events::OutboundEvent;
use crate::infra::config::Config;
use crate::services::broadcaster::{Envelope, Subscription};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Topic, QoS and retain flag for an event
pub fn route(prefix: &str, event: &OutboundEvent) -> (String, QoS, bool) {
    let topic = format!("{}/{}", prefix, event.name());
    match event {
        OutboundEvent::RaceCompleted(_) | OutboundEvent::DeviceError(_) => {
            (topic, QoS::AtLeastOnce, false)
        }
        OutboundEvent::DeviceStatus(_) => (topic, QoS::AtMostOnce, true),
        OutboundEvent::LaneFinished(_) => (topic, QoS::AtMostOnce, false),
    }
}

/// MQTT publisher actor
pub struct MqttPublisher {
    client: AsyncClient,
    events: Subscription,
    prefix: String,
}

impl MqttPublisher {
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, events: Subscription) -> Self {
        let client_id = format!("{}-{}", config.site_id(), std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, events, prefix: config.mqtt_topic_prefix().to_string() }
    }

    /// Runs until shutdown or until the broadcaster closes
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(prefix = %self.prefix, "mqtt_egress_started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        while let Some(envelope) = self.events.try_recv() {
                            self.publish(envelope).await;
                        }
                        return;
                    }
                }
                envelope = self.events.recv() => match envelope {
                    Some(envelope) => self.publish(envelope).await,
                    None => {
                        info!("mqtt_egress_closed");
                        return;
                    }
                },
            }

            if self.events.take_lagged() {
                warn!(dropped = %self.events.status().dropped, "mqtt_egress_lagging");
            }
        }
    }

    async fn publish(&self, envelope: Envelope) {
        let (topic, qos, retain) = route(&self.prefix, &envelope.event);
        let payload = envelope.event.data_json();
        if let Err(e) = self.client.publish(&topic, qos, retain, payload.into_bytes()).await {
            error!(error = %e, topic = %topic, seq = %envelope.seq, "mqtt_egress_publish_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::{DeviceStatusPayload, SensorFlags};
    use crate::domain::types::RaceState;

    #[test]
    fn test_route_topics() {
        let (topic, qos, retain) = route("race", &OutboundEvent::device_error("x"));
        assert_eq!(topic, "race/device_error");
        assert_eq!(qos, QoS::AtLeastOnce);
        assert!(!retain);

        let status = OutboundEvent::DeviceStatus(DeviceStatusPayload {
            sensors: SensorFlags { sensor1: true, sensor2: true },
            race_state: RaceState::Idle,
        });
        let (topic, qos, retain) = route("track/a", &status);
        assert_eq!(topic, "track/a/device_status");
        assert_eq!(qos, QoS::AtMostOnce);
        assert!(retain);
    }
}
