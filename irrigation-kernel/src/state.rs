use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::AbortHandle;

use crate::models::{SensorSample, SystemState};

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Everything the state manager mutates, behind its single lock.
#[derive(Debug, Default)]
pub struct ControllerState {
    pub system: SystemState,
    pub sensors: SensorSample,
    /// Bumped on every start and stop; an auto-stop armed for another value is stale.
    pub cycle: u64,
    pub auto_stop: Option<AbortHandle>,
    /// Bumped each time AI mode is entered.
    pub ai_session: u64,
}

impl ControllerState {
    pub fn next_cycle(&mut self) -> u64 {
        self.cycle = self.cycle.wrapping_add(1);
        self.cycle
    }

    pub fn cancel_auto_stop(&mut self) {
        if let Some(handle) = self.auto_stop.take() {
            handle.abort();
        }
    }
}
