use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::error::ControlError;

/// Arbitration policy: who may start the pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Manual,
    Automatic,
    Ai,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Manual => "manual",
            Mode::Automatic => "automatic",
            Mode::Ai => "ai",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Mode::Manual),
            "automatic" => Ok(Mode::Automatic),
            "ai" => Ok(Mode::Ai),
            other => Err(ControlError::InvalidMode(other.to_string())),
        }
    }
}

/// Why the pump was started or stopped. Carried in logs and in `pump_stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    ManualApi,
    Automatic,
    AutoTimeout,
    ModeChange,
    AiTrigger,
    Shutdown,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::ManualApi => "manual_api",
            Reason::Automatic => "automatic",
            Reason::AutoTimeout => "auto_timeout",
            Reason::ModeChange => "mode_change",
            Reason::AiTrigger => "ai_trigger",
            Reason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastCommand {
    Start,
    Stop,
}

/// Last known sensor readings. Replaced wholesale on every valid telemetry message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub temp: f64,
    pub hum: f64,
    pub soil: f64,
    pub level: f64,
    pub flow: f64,
    pub light: f64,
    /// Ingestion time, epoch milliseconds
    pub timestamp: i64,
}

impl Default for SensorSample {
    fn default() -> Self {
        Self {
            temp: 24.0,
            hum: 66.0,
            soil: 60.0,
            level: 56.0,
            flow: 0.0,
            light: 0.0,
            timestamp: epoch_ms(),
        }
    }
}

/// One contiguous pump-on interval.
#[derive(Debug, Clone, Copy)]
pub struct PumpCycle {
    pub started_at: Instant,
    pub started_at_ms: i64,
    pub duration_ms: u64,
}

impl PumpCycle {
    pub fn elapsed_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.started_at).as_millis() as u64
    }

    pub fn remaining_ms(&self, now: Instant) -> u64 {
        self.duration_ms.saturating_sub(self.elapsed_ms(now))
    }
}

/// Single source of truth for mode and pump. `pump.is_some()` is `pumpOn`.
#[derive(Debug, Clone)]
pub struct SystemState {
    pub mode: Mode,
    pub pump: Option<PumpCycle>,
    pub last_command: Option<LastCommand>,
    pub last_command_at: Option<i64>,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            mode: Mode::Automatic,
            pump: None,
            last_command: None,
            last_command_at: None,
        }
    }
}

impl SystemState {
    pub fn pump_on(&self) -> bool {
        self.pump.is_some()
    }

    pub fn view(&self, now: Instant) -> StatusView {
        StatusView {
            pump_on: self.pump_on(),
            mode: self.mode,
            pump_started_at: self.pump.map(|c| c.started_at_ms),
            pump_duration_ms: self.pump.map(|c| c.duration_ms).unwrap_or(0),
            remaining_ms: self.pump.map(|c| c.remaining_ms(now)).unwrap_or(0),
            last_command: self.last_command,
            last_command_at: self.last_command_at,
        }
    }
}

/// What observers and `GET /api/status` see; `remaining_ms` is computed at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub pump_on: bool,
    pub mode: Mode,
    pub pump_started_at: Option<i64>,
    pub pump_duration_ms: u64,
    pub remaining_ms: u64,
    pub last_command: Option<LastCommand>,
    pub last_command_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub status: StatusView,
    pub sensors: SensorSample,
}

/// Commands published on the command topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    SetMode {
        mode: Mode,
    },
    PumpStart {
        duration: u64,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
        mode: Mode,
    },
    PumpStop {
        #[serde(rename = "runTime")]
        run_time: u64,
        reason: Reason,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetMode { .. } => "set_mode",
            Command::PumpStart { .. } => "pump_start",
            Command::PumpStop { .. } => "pump_stop",
        }
    }
}

/// Wire envelope: `{command, timestamp, ...fields}`.
#[derive(Debug, Serialize)]
pub struct CommandMessage<'a> {
    #[serde(flatten)]
    pub command: &'a Command,
    pub timestamp: i64,
}

pub fn epoch_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
