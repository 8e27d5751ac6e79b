/*!
# Irrigation DevKit - stubs and helpers for kernel development

- Mock broker link that records published commands, no broker needed
- Scripted decision oracle (answers, failures, hangs, delays)
- Recording / failing observers for the broadcast hub
- TestHarness assembling a full state manager over the mocks
*/

pub mod mqtt_stub;
pub mod oracle_stub;
pub mod test_utils;

pub use mqtt_stub::{MockMqttClient, TelemetryBuilder};
pub use oracle_stub::{Reply, ScriptedOracle};
pub use test_utils::{FailingObserver, RecordingObserver, TestHarness};
