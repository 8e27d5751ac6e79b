/**
 * BROADCAST HUB - Real-time fan-out to connected observers
 *
 * ROLE:
 * Keeps the registry of push targets (WebSocket clients, test recorders...) and
 * delivers every state/telemetry event to all of them. Holds no system state
 * of its own: snapshots are handed in by the state manager.
 *
 * DELIVERY:
 * - Best effort: one failing observer never blocks the others nor the caller
 * - Observers reporting Closed are pruned on the spot
 * - Events are delivered in the order the state manager produced them
 */

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Mode, SensorSample, Snapshot, StatusView};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum HubEvent {
    SensorUpdate(SensorSample),
    StatusUpdate(StatusView),
    ModeUpdate { mode: Mode },
}

impl HubEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::SensorUpdate(_) => "sensor_update",
            HubEvent::StatusUpdate(_) => "status_update",
            HubEvent::ModeUpdate { .. } => "mode_update",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("observer is gone")]
    Closed,
    #[error("observer is not keeping up")]
    Lagging,
}

/// A push target. `deliver` must not block.
pub trait Observer: Send + Sync {
    fn deliver(&self, event: &HubEvent) -> Result<(), DeliveryError>;
}

impl Observer for mpsc::Sender<HubEvent> {
    fn deliver(&self, event: &HubEvent) -> Result<(), DeliveryError> {
        self.try_send(event.clone()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Lagging,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

pub type ObserverId = Uuid;

#[derive(Clone, Default)]
pub struct BroadcastHub {
    observers: Arc<RwLock<HashMap<ObserverId, Arc<dyn Observer>>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers and immediately pushes `initial`, so the observer is never stale.
    pub fn subscribe(&self, observer: Arc<dyn Observer>, initial: &Snapshot) -> ObserverId {
        let id = Uuid::new_v4();
        for event in snapshot_events(initial) {
            if let Err(e) = observer.deliver(&event) {
                warn!(observer = %id, "initial snapshot not delivered: {e}");
            }
        }
        self.observers.write().insert(id, observer);
        debug!(observer = %id, "observer subscribed");
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let removed = self.observers.write().remove(&id).is_some();
        if removed {
            debug!(observer = %id, "observer unsubscribed");
        }
        removed
    }

    /// Returns how many observers accepted the event.
    pub fn broadcast(&self, event: &HubEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let observers = self.observers.read();
            for (id, observer) in observers.iter() {
                match observer.deliver(event) {
                    Ok(()) => delivered += 1,
                    Err(DeliveryError::Closed) => closed.push(*id),
                    Err(DeliveryError::Lagging) => {
                        warn!(observer = %id, event = event.name(), "observer lagging, event dropped")
                    }
                }
            }
        }
        if !closed.is_empty() {
            let mut observers = self.observers.write();
            for id in closed {
                observers.remove(&id);
                debug!(observer = %id, "pruned closed observer");
            }
        }
        delivered
    }

    /// Answers a pull request from one observer. False if it is unknown or unreachable.
    pub fn snapshot(&self, id: ObserverId, current: &Snapshot) -> bool {
        let Some(observer) = self.observers.read().get(&id).cloned() else {
            return false;
        };
        snapshot_events(current)
            .iter()
            .all(|event| observer.deliver(event).is_ok())
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn snapshot_events(snapshot: &Snapshot) -> [HubEvent; 2] {
    [
        HubEvent::SensorUpdate(snapshot.sensors.clone()),
        HubEvent::StatusUpdate(snapshot.status.clone()),
    ]
}
