/**
 * TELEMETRY GATEWAY - Broker session, sensor ingestion, command publication
 *
 * ROLE:
 * Owns the MQTT connection. Inbound sensor payloads are normalised into a full
 * SensorSample (absent fields keep their previous value) and handed to the
 * state manager over a bounded channel. Outbound actuation commands are
 * serialised as {command, timestamp, ...fields} and published at QoS 1.
 *
 * FAILURE MODEL:
 * - Malformed payloads are dropped with a warning, never forwarded
 * - Publishing while disconnected fails fast (false), it never waits for the broker
 * - The event loop reconnects on its own after a fixed backoff and resubscribes on ConnAck
 */

use rumqttc::{AsyncClient, ConnectionError, Event, MqttOptions, NetworkOptions, Packet, QoS};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::models::{epoch_ms, Command, CommandMessage, SensorSample};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("broker disconnected")]
    Disconnected,
    #[error("publish rejected: {0}")]
    Rejected(String),
    #[error("cannot encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("malformed telemetry: {0}")]
    MalformedPayload(String),
}

/// The publishing half of a broker session.
pub trait BrokerLink: Send + Sync {
    fn is_connected(&self) -> bool;
    /// Must not block. Queue the message or fail.
    fn try_publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), GatewayError>;
}

pub struct MqttLink {
    client: AsyncClient,
    health: HealthTracker,
}

impl BrokerLink for MqttLink {
    fn is_connected(&self) -> bool {
        self.health.is_connected()
    }

    fn try_publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), GatewayError> {
        self.client
            .try_publish(topic, qos, false, payload)
            .map_err(|e| GatewayError::Rejected(e.to_string()))
    }
}

#[derive(Clone)]
pub struct TelemetryGateway {
    link: Arc<dyn BrokerLink>,
    command_topic: String,
}

impl TelemetryGateway {
    pub fn new(link: Arc<dyn BrokerLink>, command_topic: impl Into<String>) -> Self {
        Self { link, command_topic: command_topic.into() }
    }

    /// Best-effort: false when the command could not be handed to the broker.
    pub fn publish_command(&self, command: &Command) -> bool {
        match self.try_publish_command(command) {
            Ok(()) => true,
            Err(e) => {
                debug!(command = command.name(), "command not published: {e}");
                false
            }
        }
    }

    pub fn try_publish_command(&self, command: &Command) -> Result<(), GatewayError> {
        if !self.link.is_connected() {
            return Err(GatewayError::Disconnected);
        }
        let payload = serde_json::to_vec(&CommandMessage { command, timestamp: epoch_ms() })?;
        self.link.try_publish(&self.command_topic, QoS::AtLeastOnce, payload)
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}

/// Receiving half: drives the rumqttc event loop.
pub struct SensorListener {
    eventloop: rumqttc::EventLoop,
    backoff: Duration,
    router: EventRouter,
}

/// Builds the broker session. Nothing touches the network until the listener is spawned.
pub fn connect(cfg: &MqttConf, health: HealthTracker) -> (TelemetryGateway, SensorListener) {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
    opts.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(opts, 10);
    let mut net = NetworkOptions::new();
    net.set_connection_timeout(cfg.connect_timeout_ms.div_ceil(1000).max(1));
    eventloop.set_network_options(net);

    let link = MqttLink { client: client.clone(), health: health.clone() };
    let gateway = TelemetryGateway::new(Arc::new(link), cfg.command_topic.clone());
    let listener = SensorListener {
        eventloop,
        backoff: Duration::from_millis(cfg.reconnect_backoff_ms),
        router: EventRouter::new(client, cfg.sensor_topic.clone(), health),
    };
    (gateway, listener)
}

impl SensorListener {
    pub fn spawn(self, samples: mpsc::Sender<SensorSample>) -> JoinHandle<()> {
        task::spawn(self.run(samples))
    }

    async fn run(mut self, samples: mpsc::Sender<SensorSample>) {
        loop {
            let event = self.eventloop.poll().await;
            match self.router.handle(event, &samples) {
                Flow::Continue => {}
                Flow::Backoff => tokio::time::sleep(self.backoff).await,
                Flow::Stop => return,
            }
        }
    }
}

/// What the poll loop does after one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Connection error: wait the reconnect backoff before polling again.
    Backoff,
    /// The sample consumer is gone.
    Stop,
}

/// Per-event handling of the broker session, independent of the poll loop.
pub struct EventRouter {
    client: AsyncClient,
    sensor_topic: String,
    health: HealthTracker,
    last: SensorSample,
}

impl EventRouter {
    pub fn new(client: AsyncClient, sensor_topic: String, health: HealthTracker) -> Self {
        Self { client, sensor_topic, health, last: SensorSample::default() }
    }

    pub fn handle(
        &mut self,
        event: Result<Event, ConnectionError>,
        samples: &mpsc::Sender<SensorSample>,
    ) -> Flow {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(topic = %self.sensor_topic, "broker connected");
                self.health.mark_connected();
                // A clean session forgets subscriptions, so every ConnAck resubscribes.
                if let Err(e) = self.client.try_subscribe(&self.sensor_topic, QoS::AtLeastOnce) {
                    error!("subscribe {} failed: {e}", self.sensor_topic);
                }
                Flow::Continue
            }
            Ok(Event::Incoming(Packet::Publish(p))) if p.topic == self.sensor_topic => {
                match normalize_sample(&p.payload, &self.last) {
                    Ok(sample) => {
                        self.last = sample.clone();
                        match samples.try_send(sample) {
                            Ok(()) => Flow::Continue,
                            Err(TrySendError::Full(_)) => {
                                warn!("sample queue full, dropping telemetry");
                                Flow::Continue
                            }
                            Err(TrySendError::Closed(_)) => {
                                info!("sample consumer gone, stopping listener");
                                Flow::Stop
                            }
                        }
                    }
                    Err(e) => {
                        warn!(topic = %p.topic, "dropping telemetry: {e}");
                        Flow::Continue
                    }
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("broker sent disconnect");
                self.health.mark_disconnected();
                Flow::Continue
            }
            Ok(_) => Flow::Continue,
            Err(e) => {
                if self.health.is_connected() {
                    error!("broker connection lost: {e}");
                } else {
                    debug!("broker still unreachable: {e}");
                }
                self.health.mark_disconnected();
                self.health.increment_reconnects();
                Flow::Backoff
            }
        }
    }
}

const FIELDS: [(&str, &str); 6] = [
    ("temp", "temperature"),
    ("hum", "humidity"),
    ("soil", "soilMoisture"),
    ("level", "waterLevel"),
    ("flow", "flowRate"),
    ("light", "lux"),
];

/// Merges one telemetry payload over the previous sample.
pub fn normalize_sample(payload: &[u8], previous: &SensorSample) -> Result<SensorSample, GatewayError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| GatewayError::MalformedPayload("payload is not a JSON object".into()))?;

    let fallback = [previous.temp, previous.hum, previous.soil, previous.level, previous.flow, previous.light];
    let mut out = [0.0; 6];
    for (i, (primary, alias)) in FIELDS.iter().enumerate() {
        out[i] = field(obj, primary).or_else(|| field(obj, alias)).unwrap_or(fallback[i]);
    }
    let [temp, hum, soil, level, flow, light] = out;

    Ok(SensorSample { temp, hum, soil, level, flow, light, timestamp: epoch_ms() })
}

fn field(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    let v = match obj.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    v.is_finite().then_some(v)
}
