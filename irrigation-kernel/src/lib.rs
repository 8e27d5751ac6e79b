//! Irrigation kernel: pump state machine driven by MQTT telemetry, arbitrated
//! between manual, automatic and AI-assisted modes, mirrored live to observers.

pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod hub;
pub mod manager;
pub mod models;
pub mod mqtt;
pub mod oracle;
pub mod state;

pub use error::ControlError;
pub use hub::{BroadcastHub, HubEvent, Observer, ObserverId};
pub use manager::{SampleOutcome, StateManager};
pub use models::{Mode, Reason, SensorSample, StatusView};
pub use mqtt::{BrokerLink, TelemetryGateway};
pub use oracle::{Action, AiAdapter, DecisionOracle};
