/*!
Mock broker link for developing without an MQTT broker

Records every command the kernel publishes and lets tests flip the connection
state to exercise the disconnected path. Also builds sensor payloads the way a
field controller would send them.
*/

use irrigation_kernel::mqtt::{BrokerLink, GatewayError};
use rumqttc::QoS;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// Stands in for the rumqttc-backed link.
#[derive(Clone)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    connected: Arc<AtomicBool>,
}

impl MockMqttClient {
    /// Starts connected.
    pub fn new() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        tracing::info!(connected, "[mock] broker link state changed");
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Every payload on `topic`, parsed as JSON, oldest first.
    pub fn json_messages(&self, topic: &str) -> Result<Vec<Value>> {
        self.find_messages_by_topic(topic)
            .iter()
            .map(|m| Ok(serde_json::from_slice(&m.payload)?))
            .collect()
    }

    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().unwrap().clear();
    }
}

impl Default for MockMqttClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerLink for MockMqttClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn try_publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::Disconnected);
        }
        tracing::debug!("[mock] published to {}: {} bytes", topic, payload.len());
        self.published_messages.lock().unwrap().push(MockMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }
}

/// Builds sensor-topic payloads. Only the fields that were set are emitted.
#[derive(Debug, Default, Clone)]
pub struct TelemetryBuilder {
    fields: Map<String, Value>,
}

impl TelemetryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a raw key, aliases included (`soilMoisture`, `lux`...).
    pub fn field<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn temp(self, v: f64) -> Self {
        self.field("temp", v)
    }

    pub fn hum(self, v: f64) -> Self {
        self.field("hum", v)
    }

    pub fn soil(self, v: f64) -> Self {
        self.field("soil", v)
    }

    pub fn build(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.build()).unwrap_or_default()
    }
}
