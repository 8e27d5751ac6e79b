use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConf,
    pub mqtt: MqttConf,
    pub oracle: OracleConf,
    pub pump: PumpConf,
    pub hub: HubConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub sensor_topic: String,
    pub command_topic: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_backoff_ms: u64,
    /// Capacity of the gateway -> state manager sample channel
    pub sample_queue: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OracleConf {
    /// Program and leading arguments, e.g. "python3 ai_service.py". Readings are appended.
    pub command: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PumpConf {
    pub default_duration_secs: u64,
    pub ai_duration_secs: u64,
    pub max_duration_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HubConf {
    pub observer_queue: usize,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { host: "0.0.0.0".into(), port: 3001 }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "smart-watering-server".into(),
            sensor_topic: "device/sensor/data".into(),
            command_topic: "device/command".into(),
            keep_alive_secs: 15,
            connect_timeout_ms: 4000,
            reconnect_backoff_ms: 1000,
            sample_queue: 32,
        }
    }
}

impl Default for OracleConf {
    fn default() -> Self {
        Self { command: "python3 ai_service.py".into(), timeout_ms: 5000 }
    }
}

impl Default for PumpConf {
    fn default() -> Self {
        Self { default_duration_secs: 10, ai_duration_secs: 10, max_duration_secs: 3600 }
    }
}

impl Default for HubConf {
    fn default() -> Self {
        Self { observer_queue: 64 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid broker url '{0}' (expected mqtt://host[:port])")]
    BrokerUrl(String),
    #[error("invalid value for {key}: '{value}'")]
    Env { key: &'static str, value: String },
}

pub async fn load_config() -> AppConfig {
    let path = std::env::var("IRRIGATION_CONFIG").unwrap_or_else(|_| "irrigation.yaml".into());
    let mut cfg = load_file(&path).await;
    if let Err(e) = cfg.apply_env(|key| std::env::var(key).ok()) {
        warn!("ignoring environment override: {e}");
    }
    cfg
}

async fn load_file(path: &str) -> AppConfig {
    if !Path::new(path).exists() {
        warn!(path, "no config file, using defaults");
        return AppConfig::default();
    }
    let txt = fs::read_to_string(path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return AppConfig::default();
    }
    serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        warn!(path, "invalid config: {e}");
        AppConfig::default()
    })
}

impl AppConfig {
    /// Overrides from the environment. Each key is applied independently; the first bad one is reported.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut first_err = None;

        if let Some(url) = lookup("MQTT_BROKER_URL") {
            match parse_broker_url(&url) {
                Ok((host, port)) => {
                    self.mqtt.host = host;
                    self.mqtt.port = port;
                }
                Err(e) => first_err = first_err.or(Some(e)),
            }
        }
        if let Some(topic) = lookup("MQTT_TOPIC_DATA") {
            self.mqtt.sensor_topic = topic;
        }
        if let Some(topic) = lookup("MQTT_TOPIC_COMMAND") {
            self.mqtt.command_topic = topic;
        }
        if let Some(cmd) = lookup("AI_ORACLE_COMMAND") {
            self.oracle.command = cmd;
        }
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(p) => self.http.port = p,
                Err(_) => first_err = first_err.or(Some(ConfigError::Env { key: "PORT", value: port })),
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// `mqtt://host:port`, `tcp://host` or bare `host[:port]`.
pub fn parse_broker_url(url: &str) -> Result<(String, u16), ConfigError> {
    let rest = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url)
        .trim_end_matches('/');
    if rest.is_empty() {
        return Err(ConfigError::BrokerUrl(url.to_string()));
    }
    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().map_err(|_| ConfigError::BrokerUrl(url.to_string()))?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(ConfigError::BrokerUrl(url.to_string())),
        None => Ok((rest.to_string(), 1883)),
    }
}
