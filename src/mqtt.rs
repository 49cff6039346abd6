use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::errors::{Result, SentinelError};
use crate::events::{EventBus, StreamEvent};

pub fn qos_level(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

pub fn event_topic(base_topic: &str, event: &StreamEvent) -> String {
    format!("{}/streams/{}/{}", base_topic, event.stream_id(), event.kind())
}

/// Republishes event bus traffic to an MQTT broker.
pub struct MqttBridge {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttConfig,
}

impl MqttBridge {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let url = url::Url::parse(&config.broker_url)
            .map_err(|e| SentinelError::mqtt(format!("Invalid MQTT broker URL '{}': {}", config.broker_url, e)))?;
        let host = url.host_str()
            .ok_or_else(|| SentinelError::mqtt(format!("No host found in MQTT broker URL: {}", config.broker_url)))?;
        let port = url.port().unwrap_or(1883);

        info!("Connecting to MQTT broker at {}:{}", host, port);

        let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        Ok(Self { client, eventloop, config })
    }

    /// Spawn the connection loop and the forwarder. Both run until the
    /// event bus closes.
    pub fn start(self, events: &EventBus) -> JoinHandle<()> {
        let Self { client, mut eventloop, config } = self;

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => info!("Connected to MQTT broker"),
                    Ok(Event::Incoming(Packet::Disconnect)) => warn!("Disconnected from MQTT broker"),
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        let mut rx = events.subscribe();
        tokio::spawn(async move {
            let qos = qos_level(config.qos);
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("MQTT bridge lagged, skipped {} events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let payload = match serde_json::to_vec(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!("Failed to serialize {} event: {}", event.kind(), e);
                        continue;
                    }
                };
                let topic = event_topic(&config.base_topic, &event);
                // Heartbeats are transient; only status and detections honour `retain`.
                let retain = config.retain && !matches!(event, StreamEvent::Heartbeat { .. });

                if let Err(e) = client.publish(topic.clone(), qos, retain, payload).await {
                    error!("Failed to publish to {}: {}", topic, e);
                } else {
                    debug!("Published {}", topic);
                }
            }
            info!("MQTT bridge stopped");
        })
    }
}
