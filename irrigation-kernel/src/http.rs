/**
 * CONTROL SURFACE - REST + WebSocket front of the state manager
 *
 * ROLE:
 * Thin request/response wrappers: every route maps 1:1 onto a StateManager
 * operation and returns its result as JSON. /ws turns a WebSocket client into
 * a broadcast-hub observer.
 *
 * ROUTES:
 * - GET  /api/health, /api/sensors, /api/status, /api/mode
 * - POST /api/mode {mode}, /api/pump/start {duration?}, /api/pump/stop
 * - GET  /ws (sensor_update / status_update / mode_update push; "get_sensors" / "get_status" pull)
 */

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::health::{HealthTracker, ServiceHealth};
use crate::hub::HubEvent;
use crate::manager::StateManager;
use crate::models::{Reason, SensorSample, StatusView};

#[derive(Clone)]
pub struct AppState {
    pub manager: StateManager,
    pub health: HealthTracker,
    pub observer_queue: usize,
}

#[derive(Debug, Deserialize)]
struct ModeBody {
    mode: String,
}

#[derive(Debug, Deserialize)]
struct StartBody {
    duration: Option<u64>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(get_health))
        .route("/api/sensors", get(get_sensors))
        .route("/api/status", get(get_status))
        .route("/api/mode", get(get_mode).post(set_mode))
        .route("/api/pump/start", post(start_pump))
        .route("/api/pump/stop", post(stop_pump))
        .route("/ws", get(ws_upgrade))
        .with_state(app_state)
}

async fn get_health(State(app): State<AppState>) -> Json<ServiceHealth> {
    Json(app.health.report(app.manager.observer_count()))
}

async fn get_sensors(State(app): State<AppState>) -> Json<SensorSample> {
    Json(app.manager.sensors())
}

async fn get_status(State(app): State<AppState>) -> Json<StatusView> {
    Json(app.manager.status())
}

async fn get_mode(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "mode": app.manager.mode() }))
}

async fn set_mode(
    State(app): State<AppState>,
    Json(body): Json<ModeBody>,
) -> Result<Json<serde_json::Value>, ControlError> {
    let mode = app.manager.set_mode(&body.mode)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "mode": mode,
        "message": format!("Mode set to {mode}"),
    })))
}

async fn start_pump(
    State(app): State<AppState>,
    Json(body): Json<StartBody>,
) -> Result<Json<serde_json::Value>, ControlError> {
    let secs = body.duration.unwrap_or(app.manager.pump_defaults().default_duration_secs);
    let status = app.manager.start_pump(secs, Reason::ManualApi)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Pump started",
        "mode": status.mode,
        "status": status,
    })))
}

async fn stop_pump(State(app): State<AppState>) -> Result<Json<serde_json::Value>, ControlError> {
    let status = app.manager.stop_pump(Reason::ManualApi)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Pump stopped",
        "status": status,
    })))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| observe(socket, app))
}

/// One WebSocket client = one hub observer with its own queue and writer task.
async fn observe(socket: WebSocket, app: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<HubEvent>(app.observer_queue.max(1));
    let id = app.manager.subscribe(Arc::new(tx));
    info!(observer = %id, "observer connected");

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("cannot encode {}: {e}", event.name());
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match text.as_str().trim() {
                "get_sensors" | "get_status" | "get_snapshot" => {
                    if !app.manager.request_snapshot(id) {
                        debug!(observer = %id, "snapshot request not delivered");
                    }
                }
                other => debug!(observer = %id, "ignoring client message {other:?}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    app.manager.unsubscribe(id);
    writer.abort();
    info!(observer = %id, "observer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PumpConf;
    use crate::hub::BroadcastHub;
    use crate::mqtt::{BrokerLink, GatewayError, TelemetryGateway};
    use crate::oracle::{AdapterError, AiAdapter, DecisionOracle, DecisionRequest};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::time::Duration;

    struct Offline;

    impl BrokerLink for Offline {
        fn is_connected(&self) -> bool {
            false
        }

        fn try_publish(&self, _: &str, _: rumqttc::QoS, _: Vec<u8>) -> Result<(), GatewayError> {
            Err(GatewayError::Disconnected)
        }
    }

    struct AlwaysStop;

    impl DecisionOracle for AlwaysStop {
        fn query(&self, _: DecisionRequest) -> BoxFuture<'static, Result<String, AdapterError>> {
            async { Ok("0".to_string()) }.boxed()
        }
    }

    fn state() -> AppState {
        let manager = StateManager::new(
            TelemetryGateway::new(Arc::new(Offline), "device/command"),
            AiAdapter::new(Arc::new(AlwaysStop), Duration::from_secs(1)),
            BroadcastHub::new(),
            PumpConf::default(),
        );
        AppState { manager, health: HealthTracker::new(), observer_queue: 8 }
    }

    async fn code_of(res: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        body["code"].clone()
    }

    #[tokio::test]
    async fn pump_cycle_works_without_broker() {
        let app = state();
        let _router = build_router(app.clone());

        let Json(body) = start_pump(State(app.clone()), Json(StartBody { duration: Some(8) })).await.unwrap();
        assert_eq!(body["status"]["pumpDurationMs"], 8000);

        let err = start_pump(State(app.clone()), Json(StartBody { duration: None })).await.unwrap_err();
        let res = err.into_response();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(code_of(res).await, "already_running");

        assert!(stop_pump(State(app.clone())).await.is_ok());

        let Json(status) = get_status(State(app)).await;
        assert!(!status.pump_on);
        assert_eq!(status.last_command, Some(crate::models::LastCommand::Stop));
    }

    #[tokio::test]
    async fn default_duration_comes_from_config() {
        let app = state();
        let Json(body) = start_pump(State(app.clone()), Json(StartBody { duration: None })).await.unwrap();
        assert_eq!(body["status"]["pumpDurationMs"], 10_000);
    }

    #[tokio::test]
    async fn mode_validation_and_conflict() {
        let app = state();

        let err = set_mode(State(app.clone()), Json(ModeBody { mode: "turbo".into() })).await.unwrap_err();
        assert_eq!(code_of(err.into_response()).await, "invalid_mode");

        let Json(body) = set_mode(State(app.clone()), Json(ModeBody { mode: "ai".into() })).await.unwrap();
        assert_eq!(body["mode"], "ai");

        let err = start_pump(State(app.clone()), Json(StartBody { duration: Some(5) })).await.unwrap_err();
        assert_eq!(err, ControlError::ModeConflict);

        let Json(body) = get_mode(State(app)).await;
        assert_eq!(body["mode"], "ai");
    }

    #[tokio::test]
    async fn health_reports_broker_state() {
        let Json(health) = get_health(State(state())).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.broker, crate::health::BrokerStatus::Connecting);
        assert_eq!(health.observers, 0);
    }
}
