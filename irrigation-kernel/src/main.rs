/**
 * IRRIGATION KERNEL - Entry point
 *
 * ROLE: Wires config, broker session, AI adapter, state manager, broadcast hub
 * and the HTTP/WebSocket surface, then serves until Ctrl-C / SIGTERM.
 *
 * SHUTDOWN: a running pump is stopped (reason shutdown) before the process exits.
 */

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use irrigation_kernel::config::load_config;
use irrigation_kernel::health::HealthTracker;
use irrigation_kernel::http::{build_router, AppState};
use irrigation_kernel::{mqtt, AiAdapter, BroadcastHub, StateManager};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = load_config().await;
    let health = HealthTracker::new();

    let adapter = AiAdapter::from_config(&cfg.oracle).context("invalid oracle command")?;

    info!(host = %cfg.mqtt.host, port = cfg.mqtt.port, "connecting to MQTT broker");
    let (gateway, listener) = mqtt::connect(&cfg.mqtt, health.clone());

    let manager = StateManager::new(gateway, adapter, BroadcastHub::new(), cfg.pump.clone());

    let (samples_tx, samples_rx) = mpsc::channel(cfg.mqtt.sample_queue.max(1));
    let listener_task = listener.spawn(samples_tx);
    tokio::spawn(manager.clone().run_sample_loop(samples_rx));

    let app_state = AppState {
        manager: manager.clone(),
        health,
        observer_queue: cfg.hub.observer_queue,
    };
    let app = build_router(app_state);

    let ip = cfg.http.host.parse().context("invalid http.host")?;
    let addr = SocketAddr::new(ip, cfg.http.port);
    let tcp = TcpListener::bind(addr).await.with_context(|| format!("cannot bind {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    if manager.stop_for_shutdown() {
        // Let the event loop flush the pump_stop command.
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    listener_task.abort();
    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}
