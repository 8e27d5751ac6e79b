/**
 * AI DECISION ADAPTER - Request/response boundary to the external decision oracle
 *
 * ROLE:
 * Exchanges (temp, hum, soil) for a binary action. At most one consultation is
 * in flight; a caller that finds the slot taken is told so synchronously and
 * skips the cycle instead of queueing.
 *
 * FAIL-SAFE:
 * Timeout, spawn failure, non-zero exit or an unparseable answer all resolve
 * to Action::Stop. The adapter never fails open to watering.
 */

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::config::OracleConf;
use crate::models::SensorSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
}

impl Action {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Action::Start),
            0 => Some(Action::Stop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DecisionRequest {
    pub temp: f64,
    pub hum: f64,
    pub soil: f64,
}

impl From<&SensorSample> for DecisionRequest {
    fn from(s: &SensorSample) -> Self {
        Self { temp: s.temp, hum: s.hum, soil: s.soil }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),
    #[error("cannot run oracle: {0}")]
    Spawn(String),
    #[error("oracle exited with status {0:?}")]
    ExitStatus(Option<i32>),
    #[error("malformed oracle response: {0:?}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("a decision is already in flight")]
pub struct AdapterBusy;

/// The opaque external decision maker. Returns its raw textual answer.
pub trait DecisionOracle: Send + Sync + 'static {
    fn query(&self, request: DecisionRequest) -> BoxFuture<'static, Result<String, AdapterError>>;
}

/// Runs a local program per request, readings passed as trailing arguments.
pub struct ProcessOracle {
    program: String,
    args: Vec<String>,
}

impl ProcessOracle {
    pub fn from_command_line(line: &str) -> Result<Self, AdapterError> {
        let mut words = shell_words::split(line).map_err(|e| AdapterError::Spawn(e.to_string()))?;
        if words.is_empty() {
            return Err(AdapterError::Spawn("empty oracle command".into()));
        }
        let program = words.remove(0);
        Ok(Self { program, args: words })
    }
}

impl DecisionOracle for ProcessOracle {
    fn query(&self, request: DecisionRequest) -> BoxFuture<'static, Result<String, AdapterError>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(request.temp.to_string())
            .arg(request.hum.to_string())
            .arg(request.soil.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        async move {
            let output = cmd.output().await.map_err(|e| AdapterError::Spawn(e.to_string()))?;
            if !output.stderr.is_empty() {
                warn!("oracle stderr: {}", String::from_utf8_lossy(&output.stderr).trim());
            }
            if !output.status.success() {
                return Err(AdapterError::ExitStatus(output.status.code()));
            }
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        .boxed()
    }
}

/// Accepts a bare `0`/`1` or a JSON object whose `action` is `0`/`1`.
pub fn parse_action(raw: &str) -> Result<Action, AdapterError> {
    let text = raw.trim();
    let code = match text.parse::<i64>() {
        Ok(code) => Some(code),
        Err(_) => serde_json::from_str::<serde_json::Value>(text)
            .ok()
            .and_then(|v| v.get("action").and_then(|a| a.as_i64())),
    };
    code.and_then(Action::from_code)
        .ok_or_else(|| AdapterError::Malformed(text.to_string()))
}

#[derive(Clone)]
pub struct AiAdapter {
    oracle: Arc<dyn DecisionOracle>,
    slot: Arc<Semaphore>,
    timeout: Duration,
}

impl AiAdapter {
    pub fn new(oracle: Arc<dyn DecisionOracle>, timeout: Duration) -> Self {
        Self { oracle, slot: Arc::new(Semaphore::new(1)), timeout }
    }

    pub fn from_config(cfg: &OracleConf) -> Result<Self, AdapterError> {
        let oracle = ProcessOracle::from_command_line(&cfg.command)?;
        Ok(Self::new(Arc::new(oracle), Duration::from_millis(cfg.timeout_ms)))
    }

    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }

    /// Claims the single slot now, or reports busy. The slot is released when the future resolves.
    pub fn try_decide(&self, request: DecisionRequest) -> Result<BoxFuture<'static, Action>, AdapterBusy> {
        let permit = self.slot.clone().try_acquire_owned().map_err(|_| AdapterBusy)?;
        let query = self.oracle.query(request);
        let limit = self.timeout;

        Ok(async move {
            let result = match tokio::time::timeout(limit, query).await {
                Ok(Ok(raw)) => parse_action(&raw),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(AdapterError::Timeout(limit)),
            };
            drop(permit);
            result.unwrap_or_else(|e| {
                warn!("oracle failed, defaulting to stop: {e}");
                Action::Stop
            })
        }
        .boxed())
    }
}
