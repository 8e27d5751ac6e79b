use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub status: String,
    pub message: String,
    pub uptime_seconds: u64,
    pub broker: BrokerStatus,
    pub broker_reconnects: u32,
    pub observers: usize,
}

/// Broker connectivity as seen by the gateway, readable from anywhere.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    connected: Arc<AtomicBool>,
    reconnects: Arc<AtomicU32>,
    status: Arc<Mutex<BrokerStatus>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            connected: Arc::new(AtomicBool::new(false)),
            reconnects: Arc::new(AtomicU32::new(0)),
            status: Arc::new(Mutex::new(BrokerStatus::Connecting)),
        }
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
        *self.status.lock() = BrokerStatus::Connected;
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        *self.status.lock() = BrokerStatus::Disconnected;
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn broker_status(&self) -> BrokerStatus {
        *self.status.lock()
    }

    pub fn report(&self, observers: usize) -> ServiceHealth {
        ServiceHealth {
            status: "ok".into(),
            message: "Smart Watering Backend is running".into(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            broker: self.broker_status(),
            broker_reconnects: self.reconnects.load(Ordering::Relaxed),
            observers,
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
