//! Gateway HTTP server and process lifecycle.

use crate::channels::SIGNATURE_HEADER;
use crate::config::{self, Config};
use crate::gateway::ingress::{Ingress, IngressOutcome};
use crate::init;
use crate::queue::DispatchQueue;
use crate::services::Services;
use crate::worker::spawn_workers;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub ingress: Arc<Ingress>,
    pub queue: DispatchQueue,
    /// Token the provider echoes back during webhook verification.
    pub verify_token: Option<String>,
    pub port: u16,
}

/// Routes: `GET /` health, `GET /webhook` verification, `POST /webhook` messages.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/webhook", get(webhook_verify).post(webhook_receive))
        .with_state(state)
}

/// Run the gateway until Ctrl+C / SIGTERM: HTTP server, queue workers and the idle reaper.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path)?;
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) && config::resolve_app_secret(&config).is_none() {
        anyhow::bail!(
            "refusing to bind gateway to {} without webhook signature checks (set channels.whatsapp.appSecret or WHATSAPP_APP_SECRET)",
            bind
        );
    }

    let services = Services::open(&config, &config_path)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = Arc::new(services.worker(&config));
    let mut tasks = spawn_workers(worker, config.worker.concurrency, &shutdown_rx);
    if config.reaper.enabled {
        let reaper = Arc::new(services.reaper(&config));
        let interval = Duration::from_secs(config.reaper.interval_secs);
        tasks.push(tokio::spawn(reaper.run(interval, shutdown_rx.clone())));
    } else {
        log::info!("reaper disabled; run `parley reap` to close idle conversations");
    }

    let state = GatewayState {
        ingress: Arc::new(services.ingress(&config)),
        queue: services.queue.clone(),
        verify_token: config::resolve_verify_token(&config),
        port: config.gateway.port,
    };
    if state.verify_token.is_none() {
        log::warn!("no webhook verify token (WHATSAPP_VERIFY_TOKEN); subscription handshakes will be refused");
    }

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
        .await
        .context("gateway server exited");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    log::info!("gateway stopped");
    served
}

/// Completes on SIGINT or SIGTERM and tells workers and the reaper to stop.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining workers");
    let _ = shutdown_tx.send(true);
}

#[derive(Debug, Deserialize)]
struct VerifyParams {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// GET /webhook: subscription handshake. Echoes `hub.challenge` when the token matches.
async fn webhook_verify(
    State(state): State<GatewayState>,
    Query(params): Query<VerifyParams>,
) -> Response {
    let token_ok = matches!(
        (state.verify_token.as_deref(), params.verify_token.as_deref()),
        (Some(expected), Some(given)) if expected == given
    );
    if params.mode.as_deref() == Some("subscribe") && token_ok {
        log::info!("webhook: subscription verified");
        return (StatusCode::OK, params.challenge.unwrap_or_default()).into_response();
    }
    log::warn!("webhook: verification refused");
    StatusCode::FORBIDDEN.into_response()
}

/// POST /webhook: always 200 unless the payload could not be persisted (503, so the
/// provider redelivers).
async fn webhook_receive(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    match state.ingress.handle_inbound(&body, signature).await {
        Ok(IngressOutcome::Accepted { enqueued, unrouted }) => {
            log::debug!("webhook: {} enqueued, {} unrouted", enqueued, unrouted);
            StatusCode::OK
        }
        Ok(_) => StatusCode::OK,
        Err(e) => {
            log::warn!("webhook: enqueue failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// GET / returns a health JSON with queue depth (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let queue = match state.queue.counts().await {
        Ok(counts) => json!(counts),
        Err(e) => {
            log::warn!("health: queue counts unavailable: {}", e);
            serde_json::Value::Null
        }
    };
    Json(json!({
        "runtime": "running",
        "port": state.port,
        "queue": queue,
    }))
}
