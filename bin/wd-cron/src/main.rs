//! Message Dispatch Worker
//!
//! Polls the send queue, tracks connected instances and runs one paced
//! dispatch loop per instance.
//!
//! ## Configuration
//!
//! Read from the first TOML file found (`WD_CONFIG`, `config.toml`,
//! `wd-cron.toml`, `./config/config.toml`, `/etc/wd-cron/config.toml`), with
//! `WD_*` environment overrides:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `WD_QUEUE_URL` | - | Send-queue endpoint |
//! | `WD_INSTANCES_URL` | - | Instance-status endpoint |
//! | `WD_SEND_BASE_URL` | - | Provider send base URL |
//! | `WD_CONFIRMATION_URL` | - | Confirmation endpoint |
//! | `WD_LEDGER_PATH` | `./sentMessages.json` | Sent-message ledger file |
//! | `WD_SERVER_PORT` | `9090` | Health/metrics port |
//! | `WD_LOG_FILE` | - | Also append logs to this file |
//! | `LOG_FORMAT` | `text` | `json` for structured logs |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use wd_common::logging::{init_logging, init_logging_with_file, install_panic_hook};
use wd_config::{AppConfig, ConfigLoader, WindowMs};
use wd_dispatch::{
    DelayWindow, DispatchSettings, DispatchWorker, PacingPolicy, SenderConfig, UpstreamConfig,
    WorkerConfig, WorkerDeps, WorkerStats,
};

const SERVICE_NAME: &str = "wd-cron";

#[tokio::main]
async fn main() -> Result<()> {
    let config = match ConfigLoader::new().load() {
        Ok(config) => config,
        Err(e) => {
            init_logging(SERVICE_NAME);
            error!(error = %e, "Failed to load configuration");
            return Err(e.into());
        }
    };

    let log_file = config.logging.file.as_deref().map(Path::new);
    if let Err(e) = init_logging_with_file(SERVICE_NAME, log_file) {
        init_logging(SERVICE_NAME);
        warn!(error = %e, "Could not open log file, logging to console only");
    }
    install_panic_hook();

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    info!("Starting message dispatch worker");

    let deps = WorkerDeps::http(
        upstream_config(&config),
        sender_config(&config),
        &config.ledger.path,
    )?;
    let worker = Arc::new(DispatchWorker::new(worker_config(&config), deps));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let server_handle = if config.server.enabled {
        let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
        let app = axum::Router::new()
            .route("/metrics", axum::routing::get(metrics_handler))
            .route("/health", axum::routing::get(health_handler))
            .route("/ready", axum::routing::get(ready_handler))
            .with_state(Arc::clone(&worker));

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Health server listening on http://{}", addr);

        let mut shutdown_rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        }))
    } else {
        None
    };

    if let Err(e) = worker.start().await {
        error!(error = %e, path = %config.ledger.path, "Failed to load ledger, exiting");
        return Err(e.into());
    }

    info!("Press Ctrl+C to shutdown");
    shutdown_signal().await;
    info!("Shutdown signal received...");

    let lagging = worker.stop().await;
    if lagging > 0 {
        warn!(loops = lagging, "Exiting with dispatch loops still running");
    }

    let _ = shutdown_tx.send(());
    if let Some(handle) = server_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    info!("Message dispatch worker shutdown complete");
    Ok(())
}

fn window(w: &WindowMs) -> DelayWindow {
    DelayWindow {
        min: w.min(),
        max: w.max(),
    }
}

fn upstream_config(config: &AppConfig) -> UpstreamConfig {
    UpstreamConfig {
        queue_url: config.endpoints.queue_url.clone(),
        instances_url: config.endpoints.instances_url.clone(),
        confirmation_url: config.endpoints.confirmation_url.clone(),
        empty_queue_sentinel: config.endpoints.empty_queue_sentinel.clone(),
        request_timeout: Duration::from_millis(config.http.request_timeout_ms),
        connect_timeout: Duration::from_millis(config.http.connect_timeout_ms),
    }
}

fn sender_config(config: &AppConfig) -> SenderConfig {
    SenderConfig {
        base_url: config.endpoints.send_base_url.clone(),
        send_timeout: Duration::from_millis(config.http.send_timeout_ms),
        connect_timeout: Duration::from_millis(config.http.connect_timeout_ms),
    }
}

fn worker_config(config: &AppConfig) -> WorkerConfig {
    let pacing = &config.pacing;
    WorkerConfig {
        queue_interval: Duration::from_millis(config.polling.queue_interval_ms),
        instances_interval: Duration::from_millis(config.polling.instances_interval_ms),
        shutdown_timeout: Duration::from_secs(30),
        settings: DispatchSettings {
            max_send_attempts: config.retry.max_send_attempts,
            idle_poll_interval: Duration::from_millis(config.polling.idle_poll_interval_ms),
        },
        pacing: PacingPolicy {
            max_messages_per_cycle: pacing.max_messages_per_cycle,
            message_interval: window(&pacing.message_interval),
            extended_pause: window(&pacing.extended_pause),
            extended_pause_probability: pacing.extended_pause_probability,
            occasional_break: window(&pacing.occasional_break),
            occasional_break_probability: pacing.occasional_break_probability,
            reading: window(&pacing.reading),
            writing_base: window(&pacing.writing_base),
            writing_per_word: window(&pacing.writing_per_word),
            retry_backoff: window(&config.retry.backoff),
        },
    }
}

fn render_metrics(stats: &WorkerStats) -> String {
    let gauges = [
        ("wd_up", "Dispatch worker is up", 1),
        ("wd_ready", "Ledger loaded", stats.ready as usize),
        ("wd_queue_depth", "Messages waiting in the working queue", stats.state.queue_depth),
        ("wd_in_flight", "Messages being dispatched", stats.state.in_flight),
        ("wd_ledger_size", "Message ids recorded as sent", stats.state.ledger_size),
        ("wd_abandoned", "Messages abandoned this run", stats.state.abandoned),
        ("wd_active_instances", "Instances with a running dispatch loop", stats.active_instances),
    ];

    let mut out = String::new();
    for (name, help, value) in gauges {
        out.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
        ));
    }
    out
}

async fn metrics_handler(State(worker): State<Arc<DispatchWorker>>) -> String {
    render_metrics(&worker.stats())
}

async fn health_handler(State(worker): State<Arc<DispatchWorker>>) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION"),
        "worker": worker.stats(),
    }))
}

async fn ready_handler(
    State(worker): State<Arc<DispatchWorker>>,
) -> (StatusCode, axum::Json<serde_json::Value>) {
    if worker.is_ready() {
        (StatusCode::OK, axum::Json(serde_json::json!({ "status": "READY" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({ "status": "NOT_READY" })),
        )
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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
}
