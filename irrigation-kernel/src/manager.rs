/**
 * SYSTEM STATE MANAGER - Mode / pump state machine
 *
 * ROLE:
 * Sole owner of SystemState and of the latest SensorSample. Every operation
 * (mode check -> pump mutation -> command emission -> broadcast) runs as one
 * unit under a single lock, so HTTP calls, the sample loop, auto-stop timers
 * and AI decisions never interleave mid-transition.
 *
 * RULES:
 * - Setting AI mode force-stops a running pump (reason mode_change), even if AI
 *   was already the mode; only a real transition starts a new AI session
 * - Explicit starts are rejected in AI mode; only AI decisions start the pump there
 * - Only non-AI modes arm the auto-stop timer; a timer carries the cycle it was
 *   armed for and is a no-op once that cycle is over
 * - At most one AI consultation in flight; extra samples are skipped
 */

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PumpConf;
use crate::error::ControlError;
use crate::hub::{BroadcastHub, HubEvent, Observer, ObserverId};
use crate::models::{epoch_ms, Command, LastCommand, Mode, PumpCycle, Reason, SensorSample, Snapshot, StatusView};
use crate::mqtt::TelemetryGateway;
use crate::oracle::{Action, AiAdapter, DecisionRequest};
use crate::state::{new_state, ControllerState, Shared};

/// What `on_sample` did with a sample.
#[derive(Debug)]
pub enum SampleOutcome {
    /// Snapshot updated, no consultation needed (not in AI mode).
    Recorded,
    /// A consultation was issued; the handle resolves once its decision is applied.
    Consulting(JoinHandle<()>),
    /// In AI mode but a consultation is already outstanding.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Caller,
    AiDecision,
}

#[derive(Clone)]
pub struct StateManager {
    inner: Shared<ControllerState>,
    gateway: TelemetryGateway,
    adapter: AiAdapter,
    hub: BroadcastHub,
    pump: Arc<PumpConf>,
}

impl StateManager {
    pub fn new(gateway: TelemetryGateway, adapter: AiAdapter, hub: BroadcastHub, pump: PumpConf) -> Self {
        Self {
            inner: new_state(ControllerState::default()),
            gateway,
            adapter,
            hub,
            pump: Arc::new(pump),
        }
    }

    // ---- reads ----

    pub fn sensors(&self) -> SensorSample {
        self.inner.lock().sensors.clone()
    }

    pub fn status(&self) -> StatusView {
        self.inner.lock().system.view(Instant::now())
    }

    pub fn mode(&self) -> Mode {
        self.inner.lock().system.mode
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();
        snapshot_of(&inner)
    }

    pub fn pump_defaults(&self) -> &PumpConf {
        &self.pump
    }

    // ---- observers ----

    /// Registers an observer. The initial snapshot is pushed under the state lock,
    /// so no update can reach it before the snapshot does.
    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let inner = self.inner.lock();
        self.hub.subscribe(observer, &snapshot_of(&inner))
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.hub.unsubscribe(id)
    }

    pub fn request_snapshot(&self, id: ObserverId) -> bool {
        let inner = self.inner.lock();
        self.hub.snapshot(id, &snapshot_of(&inner))
    }

    pub fn observer_count(&self) -> usize {
        self.hub.len()
    }

    // ---- control operations ----

    pub fn set_mode(&self, requested: &str) -> Result<Mode, ControlError> {
        let mode: Mode = requested.parse()?;
        let mut inner = self.inner.lock();
        let previous = inner.system.mode;
        inner.system.mode = mode;
        info!(from = %previous, to = %mode, "mode changed");

        self.emit(&Command::SetMode { mode });

        if mode == Mode::Ai {
            if previous != Mode::Ai {
                inner.ai_session = inner.ai_session.wrapping_add(1);
            }
            // Setting AI always hands the pump to the oracle from a stopped state.
            if inner.system.pump_on() {
                // Cannot fail: pump_on was just checked under the same lock.
                let _ = self.stop_locked(&mut inner, Reason::ModeChange);
            }
        } else if previous == Mode::Ai {
            if let Some(cycle) = inner.system.pump {
                // The running cycle now follows non-AI rules: bound it by its remaining time.
                let remaining = cycle.remaining_ms(Instant::now());
                let generation = inner.cycle;
                inner.cancel_auto_stop();
                inner.auto_stop = Some(self.arm_auto_stop(generation, remaining));
                debug!(remaining_ms = remaining, "auto-stop armed for cycle started in AI mode");
            }
        }

        self.hub.broadcast(&HubEvent::ModeUpdate { mode });
        self.hub.broadcast(&HubEvent::StatusUpdate(inner.system.view(Instant::now())));
        Ok(mode)
    }

    pub fn start_pump(&self, duration_secs: u64, reason: Reason) -> Result<StatusView, ControlError> {
        let mut inner = self.inner.lock();
        self.start_locked(&mut inner, duration_secs, reason, Origin::Caller)
    }

    pub fn stop_pump(&self, reason: Reason) -> Result<StatusView, ControlError> {
        let mut inner = self.inner.lock();
        self.stop_locked(&mut inner, reason)
    }

    /// Stops a running pump before the process exits. True when a stop was issued.
    pub fn stop_for_shutdown(&self) -> bool {
        match self.stop_pump(Reason::Shutdown) {
            Ok(_) => {
                warn!("pump stopped for shutdown");
                true
            }
            Err(ControlError::NotRunning) => {
                debug!("pump already off at shutdown");
                false
            }
            Err(e) => {
                warn!("cannot stop pump at shutdown: {e}");
                false
            }
        }
    }

    // ---- telemetry ----

    /// Records a sample, pushes it to observers and, in AI mode, consults the oracle
    /// unless a consultation is already outstanding.
    pub fn on_sample(&self, sample: SensorSample) -> SampleOutcome {
        let (decision, session) = {
            let mut inner = self.inner.lock();
            inner.sensors = sample.clone();
            self.hub.broadcast(&HubEvent::SensorUpdate(sample.clone()));

            if inner.system.mode != Mode::Ai {
                return SampleOutcome::Recorded;
            }
            match self.adapter.try_decide(DecisionRequest::from(&sample)) {
                Ok(decision) => (decision, inner.ai_session),
                Err(busy) => {
                    debug!("skipping sample: {busy}");
                    return SampleOutcome::Skipped;
                }
            }
        };

        let manager = self.clone();
        let soil = sample.soil;
        let temp = sample.temp;
        SampleOutcome::Consulting(tokio::spawn(async move {
            let action = decision.await;
            info!(?action, soil, temp, "AI decision");
            manager.apply_decision(action, session);
        }))
    }

    /// Consumes samples from the gateway until the channel closes.
    pub async fn run_sample_loop(self, mut samples: mpsc::Receiver<SensorSample>) {
        while let Some(sample) = samples.recv().await {
            self.on_sample(sample);
        }
        info!("sample channel closed");
    }

    fn apply_decision(&self, action: Action, session: u64) {
        let mut inner = self.inner.lock();
        if inner.system.mode != Mode::Ai || inner.ai_session != session {
            debug!(?action, "discarding decision from an earlier AI session");
            return;
        }
        let result = match (action, inner.system.pump_on()) {
            (Action::Start, false) => {
                let secs = self.pump.ai_duration_secs;
                self.start_locked(&mut inner, secs, Reason::AiTrigger, Origin::AiDecision)
            }
            (Action::Stop, true) => self.stop_locked(&mut inner, Reason::AiTrigger),
            _ => return,
        };
        if let Err(e) = result {
            warn!("AI decision not applied: {e}");
        }
    }

    // ---- transitions (lock held) ----

    fn start_locked(
        &self,
        inner: &mut ControllerState,
        duration_secs: u64,
        reason: Reason,
        origin: Origin,
    ) -> Result<StatusView, ControlError> {
        let mode = inner.system.mode;
        if mode == Mode::Ai && origin != Origin::AiDecision {
            return Err(ControlError::ModeConflict);
        }
        if inner.system.pump_on() {
            return Err(ControlError::AlreadyRunning);
        }
        let max = self.pump.max_duration_secs;
        let duration_ms = match duration_secs.checked_mul(1000) {
            Some(ms) if duration_secs > 0 && duration_secs <= max => ms,
            _ => return Err(ControlError::InvalidDuration { secs: duration_secs, max }),
        };

        let now = Instant::now();
        let now_ms = epoch_ms();
        inner.cancel_auto_stop();
        let generation = inner.next_cycle();
        inner.system.pump = Some(PumpCycle { started_at: now, started_at_ms: now_ms, duration_ms });
        inner.system.last_command = Some(LastCommand::Start);
        inner.system.last_command_at = Some(now_ms);
        info!(%reason, %mode, duration_ms, "pump started");

        self.emit(&Command::PumpStart { duration: duration_secs, duration_ms, mode });

        let view = inner.system.view(now);
        self.hub.broadcast(&HubEvent::StatusUpdate(view.clone()));

        if mode != Mode::Ai {
            inner.auto_stop = Some(self.arm_auto_stop(generation, duration_ms));
        }
        Ok(view)
    }

    fn stop_locked(&self, inner: &mut ControllerState, reason: Reason) -> Result<StatusView, ControlError> {
        let Some(cycle) = inner.system.pump.take() else {
            return Err(ControlError::NotRunning);
        };

        let now = Instant::now();
        let run_time = cycle.elapsed_ms(now);
        inner.cancel_auto_stop();
        inner.next_cycle();
        inner.system.last_command = Some(LastCommand::Stop);
        inner.system.last_command_at = Some(epoch_ms());
        info!(%reason, run_time_ms = run_time, "pump stopped");

        self.emit(&Command::PumpStop { run_time, reason });

        let view = inner.system.view(now);
        self.hub.broadcast(&HubEvent::StatusUpdate(view.clone()));
        Ok(view)
    }

    fn arm_auto_stop(&self, generation: u64, after_ms: u64) -> tokio::task::AbortHandle {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(after_ms)).await;
            manager.expire_cycle(generation);
        })
        .abort_handle()
    }

    /// Fire-time re-validation: the cycle must still be the one armed for, and not under AI.
    fn expire_cycle(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.cycle != generation || !inner.system.pump_on() || inner.system.mode == Mode::Ai {
            debug!(generation, "stale auto-stop ignored");
            return;
        }
        inner.auto_stop = None;
        let _ = self.stop_locked(&mut inner, Reason::AutoTimeout);
    }

    fn emit(&self, command: &Command) {
        if !self.gateway.publish_command(command) {
            warn!(command = command.name(), "command not delivered to broker");
        }
    }
}

fn snapshot_of(inner: &ControllerState) -> Snapshot {
    Snapshot { status: inner.system.view(Instant::now()), sensors: inner.sensors.clone() }
}
