use irrigation_devkit::{FailingObserver, Reply, ScriptedOracle, TelemetryBuilder, TestHarness};
use irrigation_kernel::{ControlError, HubEvent, Mode, Reason, SampleOutcome};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn dry_soil() -> TelemetryBuilder {
    TelemetryBuilder::new().temp(31.0).hum(40.0).soil(15.0)
}

#[tokio::test(start_paused = true)]
async fn automatic_start_auto_stops_after_duration() {
    let h = TestHarness::new();

    let view = h.manager.start_pump(8, Reason::Automatic).unwrap();
    assert!(view.pump_on);
    h.assert_command_sent("pump_start", &json!({"duration": 8, "durationMs": 8000, "mode": "automatic"}))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(7999)).await;
    assert!(h.manager.status().pump_on);

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert!(!h.manager.status().pump_on);
    h.assert_command_sent("pump_stop", &json!({"reason": "auto_timeout", "runTime": 8000})).unwrap();
    assert_eq!(h.count("pump_stop"), 1);
}

#[tokio::test(start_paused = true)]
async fn explicit_stop_beats_timer_without_double_emit() {
    let h = TestHarness::new();
    h.manager.start_pump(4, Reason::ManualApi).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.manager.stop_pump(Reason::ManualApi).unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.command_names(), vec!["pump_start", "pump_stop"]);
    h.assert_command_sent("pump_stop", &json!({"reason": "manual_api", "runTime": 1000})).unwrap();
}

#[tokio::test(start_paused = true)]
async fn remaining_time_never_increases_and_is_zero_after_stop() {
    let h = TestHarness::new();
    h.manager.start_pump(5, Reason::ManualApi).unwrap();

    let mut previous = h.manager.status().remaining_ms;
    assert_eq!(previous, 5000);
    for _ in 0..4 {
        tokio::time::advance(Duration::from_millis(900)).await;
        let now = h.manager.status().remaining_ms;
        assert!(now <= previous, "{now} > {previous}");
        previous = now;
    }
    assert_eq!(previous, 1400);

    let view = h.manager.stop_pump(Reason::ManualApi).unwrap();
    assert_eq!(view.remaining_ms, 0);
    assert_eq!(h.manager.status().remaining_ms, 0);
}

#[tokio::test]
async fn entering_ai_force_stops_the_pump() {
    let h = TestHarness::new();
    h.manager.set_mode("manual").unwrap();
    h.manager.start_pump(60, Reason::ManualApi).unwrap();

    assert_eq!(h.manager.set_mode("ai").unwrap(), Mode::Ai);
    assert!(!h.manager.status().pump_on);
    h.assert_command_sent("pump_stop", &json!({"reason": "mode_change"})).unwrap();
    h.assert_command_sent("set_mode", &json!({"mode": "ai"})).unwrap();
    assert!(h.observer.events().contains(&HubEvent::ModeUpdate { mode: Mode::Ai }));
}

#[tokio::test(start_paused = true)]
async fn reasserting_ai_stops_an_ai_started_pump() {
    let oracle = ScriptedOracle::default().then(Reply::start(), Duration::ZERO);
    let h = TestHarness::with_oracle(oracle, Duration::from_secs(5));
    h.manager.set_mode("ai").unwrap();
    TestHarness::settle(h.send_telemetry(&dry_soil()).unwrap()).await.unwrap();
    assert!(h.manager.status().pump_on);

    assert_eq!(h.manager.set_mode("ai").unwrap(), Mode::Ai);
    assert!(!h.manager.status().pump_on);
    assert_eq!(h.command_names(), vec!["set_mode", "pump_start", "set_mode", "pump_stop"]);
    h.assert_command_sent("pump_stop", &json!({"reason": "mode_change"})).unwrap();

    // Same AI session: the oracle may start the pump again on the next sample.
    h.oracle.push(Reply::start(), Duration::ZERO);
    TestHarness::settle(h.send_telemetry(&dry_soil()).unwrap()).await.unwrap();
    assert!(h.manager.status().pump_on);
}

#[tokio::test]
async fn entering_ai_with_pump_off_emits_no_stop() {
    let h = TestHarness::new();
    h.manager.set_mode("ai").unwrap();
    assert_eq!(h.command_names(), vec!["set_mode"]);
}

#[tokio::test]
async fn explicit_start_in_ai_mode_is_a_conflict() {
    let h = TestHarness::new();
    h.manager.set_mode("ai").unwrap();
    h.reset();

    let before = h.manager.status();
    for reason in [Reason::ManualApi, Reason::Automatic, Reason::AiTrigger] {
        assert_eq!(h.manager.start_pump(10, reason), Err(ControlError::ModeConflict));
    }
    assert_eq!(h.manager.status(), before);
    assert!(h.command_names().is_empty());
    assert!(h.observer.events().is_empty());
}

#[tokio::test]
async fn concurrent_stops_succeed_exactly_once() {
    let h = Arc::new(TestHarness::new());
    h.manager.start_pump(60, Reason::ManualApi).unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        tasks.push(tokio::task::spawn_blocking(move || h.manager.stop_pump(Reason::ManualApi)));
    }
    let mut ok = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e, ControlError::NotRunning),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(h.count("pump_stop"), 1);
}

#[tokio::test(start_paused = true)]
async fn ai_start_decision_runs_pump_and_skips_overlapping_samples() {
    let oracle = ScriptedOracle::default().then(Reply::start(), Duration::from_secs(2));
    let h = TestHarness::with_oracle(oracle, Duration::from_secs(5));
    h.manager.set_mode("ai").unwrap();

    let first = h.send_telemetry(&dry_soil()).unwrap();
    assert!(matches!(first, SampleOutcome::Consulting(_)));
    let second = h.send_telemetry(&dry_soil().soil(14.0)).unwrap();
    assert!(matches!(second, SampleOutcome::Skipped));
    assert_eq!(h.manager.sensors().soil, 14.0);

    TestHarness::settle(first).await.unwrap();
    assert_eq!(h.oracle.calls(), 1);
    assert_eq!(h.oracle.requests()[0].soil, 15.0);

    let status = h.manager.status();
    assert!(status.pump_on);
    assert_eq!(status.pump_duration_ms, 10_000);
    h.assert_command_sent("pump_start", &json!({"duration": 10, "mode": "ai"})).unwrap();

    // No wall-clock auto-stop under AI.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.manager.status().pump_on);
}

#[tokio::test(start_paused = true)]
async fn ai_stop_decision_stops_a_running_pump() {
    let oracle = ScriptedOracle::default()
        .then(Reply::start(), Duration::ZERO)
        .then(Reply::stop(), Duration::ZERO);
    let h = TestHarness::with_oracle(oracle, Duration::from_secs(5));
    h.manager.set_mode("ai").unwrap();

    TestHarness::settle(h.send_telemetry(&dry_soil()).unwrap()).await.unwrap();
    assert!(h.manager.status().pump_on);

    TestHarness::settle(h.send_telemetry(&TelemetryBuilder::new().soil(70.0)).unwrap()).await.unwrap();
    assert!(!h.manager.status().pump_on);
    h.assert_command_sent("pump_stop", &json!({"reason": "ai_trigger"})).unwrap();
}

#[tokio::test(start_paused = true)]
async fn redundant_decisions_change_nothing() {
    let oracle = ScriptedOracle::default()
        .then(Reply::stop(), Duration::ZERO)
        .then(Reply::start(), Duration::ZERO)
        .then(Reply::start(), Duration::ZERO);
    let h = TestHarness::with_oracle(oracle, Duration::from_secs(5));
    h.manager.set_mode("ai").unwrap();

    // Stop while off.
    TestHarness::settle(h.send_telemetry(&dry_soil()).unwrap()).await.unwrap();
    assert_eq!(h.command_names(), vec!["set_mode"]);

    // Start, then Start while already on.
    TestHarness::settle(h.send_telemetry(&dry_soil()).unwrap()).await.unwrap();
    TestHarness::settle(h.send_telemetry(&dry_soil()).unwrap()).await.unwrap();
    assert_eq!(h.command_names(), vec!["set_mode", "pump_start"]);
}

#[tokio::test(start_paused = true)]
async fn oracle_timeout_fails_safe() {
    let oracle = ScriptedOracle::default()
        .then(Reply::start(), Duration::ZERO)
        .then(Reply::Hang, Duration::ZERO)
        .then(Reply::Hang, Duration::ZERO);
    let h = TestHarness::with_oracle(oracle, Duration::from_secs(3));
    h.manager.set_mode("ai").unwrap();

    TestHarness::settle(h.send_telemetry(&dry_soil()).unwrap()).await.unwrap();
    assert!(h.manager.status().pump_on);

    // Pump on: the timeout resolves to Stop.
    TestHarness::settle(h.send_telemetry(&dry_soil()).unwrap()).await.unwrap();
    assert!(!h.manager.status().pump_on);
    h.assert_command_sent("pump_stop", &json!({"reason": "ai_trigger"})).unwrap();

    // Pump off: the timeout is a no-op.
    let before = h.command_names();
    TestHarness::settle(h.send_telemetry(&dry_soil()).unwrap()).await.unwrap();
    assert_eq!(h.command_names(), before);
}

#[tokio::test(start_paused = true)]
async fn oracle_failure_and_garbage_fail_safe() {
    let oracle = ScriptedOracle::default()
        .then(Reply::start(), Duration::ZERO)
        .then(Reply::Fail, Duration::ZERO)
        .then(Reply::Answer("definitely water".into()), Duration::ZERO);
    let h = TestHarness::with_oracle(oracle, Duration::from_secs(3));
    h.manager.set_mode("ai").unwrap();

    TestHarness::settle(h.send_telemetry(&dry_soil()).unwrap()).await.unwrap();
    TestHarness::settle(h.send_telemetry(&dry_soil()).unwrap()).await.unwrap();
    assert!(!h.manager.status().pump_on);

    TestHarness::settle(h.send_telemetry(&dry_soil()).unwrap()).await.unwrap();
    assert!(!h.manager.status().pump_on);
    assert_eq!(h.count("pump_start"), 1);
}

#[tokio::test(start_paused = true)]
async fn decision_from_a_previous_ai_session_is_discarded() {
    let oracle = ScriptedOracle::default().then(Reply::start(), Duration::from_secs(2));
    let h = TestHarness::with_oracle(oracle, Duration::from_secs(5));
    h.manager.set_mode("ai").unwrap();

    let pending = h.send_telemetry(&dry_soil()).unwrap();
    h.manager.set_mode("manual").unwrap();
    h.manager.set_mode("ai").unwrap();

    TestHarness::settle(pending).await.unwrap();
    assert!(!h.manager.status().pump_on);
    assert_eq!(h.count("pump_start"), 0);
}

#[tokio::test]
async fn samples_outside_ai_never_consult() {
    let h = TestHarness::new();
    for mode in ["manual", "automatic"] {
        h.manager.set_mode(mode).unwrap();
        assert!(matches!(h.send_telemetry(&dry_soil()).unwrap(), SampleOutcome::Recorded));
    }
    assert_eq!(h.oracle.calls(), 0);
}

#[tokio::test]
async fn broker_outage_does_not_block_control() {
    let h = TestHarness::new();
    h.broker.set_connected(false);

    h.manager.start_pump(10, Reason::ManualApi).unwrap();
    assert!(h.manager.status().pump_on);
    h.manager.stop_pump(Reason::ManualApi).unwrap();
    assert!(h.command_names().is_empty());

    h.broker.set_connected(true);
    h.manager.start_pump(10, Reason::ManualApi).unwrap();
    assert_eq!(h.command_names(), vec!["pump_start"]);
}

#[tokio::test]
async fn observers_see_updates_in_order_despite_a_failing_peer() {
    let h = TestHarness::new();
    h.manager.subscribe(Arc::new(FailingObserver));
    h.observer.clear();

    h.send_telemetry(&TelemetryBuilder::new().soil(33.0)).unwrap();
    h.manager.start_pump(5, Reason::ManualApi).unwrap();
    h.manager.set_mode("ai").unwrap();

    assert_eq!(
        h.observer.names(),
        vec!["sensor_update", "status_update", "status_update", "mode_update", "status_update"]
    );
    let events = h.observer.events();
    match &events[4] {
        HubEvent::StatusUpdate(status) => {
            assert!(!status.pump_on);
            assert_eq!(status.mode, Mode::Ai);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn pull_snapshot_answers_only_the_requester() {
    let h = TestHarness::new();
    let other = Arc::new(irrigation_devkit::RecordingObserver::default());
    h.manager.subscribe(other.clone());
    h.observer.clear();
    other.clear();

    assert!(h.manager.request_snapshot(h.observer_id));
    assert_eq!(h.observer.names(), vec!["sensor_update", "status_update"]);
    assert!(other.events().is_empty());

    assert!(h.manager.unsubscribe(h.observer_id));
    assert!(!h.manager.request_snapshot(h.observer_id));
}
