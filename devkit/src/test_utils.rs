/*!
Test harness for the irrigation kernel

Assembles a complete StateManager over the mock broker link, a scripted
oracle and a recording observer, then offers helpers to feed telemetry and
assert on published commands and broadcast events.
*/

use crate::mqtt_stub::{MockMqttClient, TelemetryBuilder};
use crate::oracle_stub::ScriptedOracle;
use anyhow::Result;
use irrigation_kernel::config::PumpConf;
use irrigation_kernel::hub::{DeliveryError, HubEvent, Observer, ObserverId};
use irrigation_kernel::mqtt::normalize_sample;
use irrigation_kernel::{AiAdapter, BroadcastHub, SampleOutcome, SensorSample, StateManager, TelemetryGateway};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const COMMAND_TOPIC: &str = "device/command";

/// Keeps every event it receives.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<HubEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<HubEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(HubEvent::name).collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl Observer for RecordingObserver {
    fn deliver(&self, event: &HubEvent) -> Result<(), DeliveryError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Rejects everything, like a client whose socket buffer is full.
pub struct FailingObserver;

impl Observer for FailingObserver {
    fn deliver(&self, _event: &HubEvent) -> Result<(), DeliveryError> {
        Err(DeliveryError::Lagging)
    }
}

pub struct TestHarness {
    pub broker: MockMqttClient,
    pub oracle: Arc<ScriptedOracle>,
    pub observer: Arc<RecordingObserver>,
    pub observer_id: ObserverId,
    pub manager: StateManager,
    last_sample: Mutex<SensorSample>,
}

impl TestHarness {
    /// Oracle answers "stop" to everything, 5s adapter timeout.
    pub fn new() -> Self {
        Self::with_oracle(ScriptedOracle::default(), Duration::from_secs(5))
    }

    pub fn with_oracle(oracle: ScriptedOracle, timeout: Duration) -> Self {
        tracing_subscriber::fmt().with_test_writer().try_init().ok();

        let broker = MockMqttClient::new();
        let oracle = Arc::new(oracle);
        let gateway = TelemetryGateway::new(Arc::new(broker.clone()), COMMAND_TOPIC);
        let adapter = AiAdapter::new(oracle.clone(), timeout);
        let manager = StateManager::new(gateway, adapter, BroadcastHub::new(), PumpConf::default());

        let observer = Arc::new(RecordingObserver::default());
        let observer_id = manager.subscribe(observer.clone());

        Self {
            broker,
            oracle,
            observer,
            observer_id,
            manager,
            last_sample: Mutex::new(SensorSample::default()),
        }
    }

    /// Runs a payload through gateway normalisation, then into the state manager.
    pub fn send_telemetry(&self, payload: &TelemetryBuilder) -> Result<SampleOutcome> {
        let sample = {
            let mut last = self.last_sample.lock().unwrap();
            let sample = normalize_sample(&payload.to_bytes(), &last)?;
            *last = sample.clone();
            sample
        };
        Ok(self.manager.on_sample(sample))
    }

    /// Waits for a consultation issued by `send_telemetry` to be applied.
    pub async fn settle(outcome: SampleOutcome) -> Result<()> {
        if let SampleOutcome::Consulting(handle) = outcome {
            handle.await?;
        }
        Ok(())
    }

    pub fn commands(&self) -> Vec<Value> {
        self.broker.json_messages(COMMAND_TOPIC).unwrap_or_default()
    }

    pub fn command_names(&self) -> Vec<String> {
        self.commands()
            .iter()
            .filter_map(|c| c["command"].as_str().map(str::to_string))
            .collect()
    }

    pub fn count(&self, command: &str) -> usize {
        self.command_names().iter().filter(|c| *c == command).count()
    }

    pub fn last_command(&self, command: &str) -> Option<Value> {
        self.commands().into_iter().filter(|c| c["command"] == command).last()
    }

    /// Asserts the last `command` carries every field of `expected` with the same value.
    pub fn assert_command_sent(&self, command: &str, expected: &Value) -> Result<()> {
        let Some(actual) = self.last_command(command) else {
            anyhow::bail!("no {command} published (saw {:?})", self.command_names());
        };
        if let Value::Object(fields) = expected {
            for (key, value) in fields {
                if actual.get(key) != Some(value) {
                    anyhow::bail!("{command}.{key}: expected {value}, got {:?}", actual.get(key));
                }
            }
        }
        Ok(())
    }

    pub fn reset(&self) {
        self.broker.clear();
        self.observer.clear();
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use irrigation_kernel::Reason;

    #[tokio::test]
    async fn harness_wires_observer_and_broker() {
        let harness = TestHarness::new();
        assert_eq!(harness.observer.names(), vec!["sensor_update", "status_update"]);

        harness.manager.start_pump(3, Reason::ManualApi).unwrap();
        harness
            .assert_command_sent("pump_start", &serde_json::json!({"duration": 3, "durationMs": 3000}))
            .unwrap();
        assert!(harness.assert_command_sent("pump_stop", &serde_json::json!({})).is_err());
        assert_eq!(harness.count("pump_start"), 1);
    }

    #[tokio::test]
    async fn telemetry_goes_through_normalisation() {
        let harness = TestHarness::new();
        harness.send_telemetry(&TelemetryBuilder::new().field("soilMoisture", 21)).unwrap();
        assert_eq!(harness.manager.sensors().soil, 21.0);
        assert_eq!(harness.manager.sensors().temp, 24.0);
    }
}
