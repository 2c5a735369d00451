mod config;
mod control;
mod db;
mod error;
mod ingest;
mod mqtt;
mod retry;
mod service;
mod status;
mod web;

use anyhow::{Context, Result};
use std::env;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use control::ControlStore;
use db::Db;
use ingest::Ingestor;
use service::{ControlService, TelemetryService};
use status::BridgeStatus;

/// Attempts for a telemetry read before the web caller gets a 503.
const QUERY_ATTEMPTS: u32 = 3;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "bridge.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Stores ──────────────────────────────────────────────────────
    let db = Db::connect(&cfg.storage.db_url)
        .await
        .context("telemetry database unavailable")?;
    db.migrate().await.context("telemetry schema")?;

    let control = ControlStore::open(&cfg.storage.control_path)
        .await
        .context("control state unavailable")?;

    info!(
        db = %cfg.storage.db_url,
        control = %control.path().display(),
        stored_readings = db.count().await.unwrap_or_default(),
        "stores ready"
    );

    // ── Shared status (ephemeral, for the web UI) ───────────────────
    let status = BridgeStatus::shared();
    status
        .write()
        .await
        .record_system("bridge started".to_string());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Web server ──────────────────────────────────────────────────
    let app_state = web::AppState {
        control: ControlService::new(control, status.clone()),
        telemetry: TelemetryService::new(
            db.clone(),
            cfg.telemetry.max_window,
            QUERY_ATTEMPTS,
            cfg.ingest.store_backoff(),
        ),
        status: status.clone(),
        db: db.clone(),
        default_window: cfg.telemetry.default_window,
    };
    let listener = web::bind(cfg.web.port).await?;
    let web_task = tokio::spawn(web::serve(listener, app_state, shutdown_rx.clone()));

    // ── MQTT ingest ─────────────────────────────────────────────────
    let ingestor = Ingestor::new(db.clone(), status.clone(), &cfg.ingest);
    let ingest_task = tokio::spawn(ingestor.run(
        cfg.mqtt.clone(),
        cfg.ingest.reconnect_backoff(),
        cfg.ingest.drain_timeout(),
        shutdown_rx,
    ));

    shutdown_signal().await;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    let grace = cfg.ingest.shutdown_grace();
    if timeout(grace, ingest_task).await.is_err() {
        warn!(grace_ms = grace.as_millis() as u64, "ingestor did not stop in time");
    }
    match timeout(grace, web_task).await {
        Ok(Ok(Err(e))) => warn!("web server: {e:#}"),
        Err(_) => warn!("web server did not stop in time"),
        _ => {}
    }

    db.close().await;
    info!("bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler unavailable: {e}");
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
                warn!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
