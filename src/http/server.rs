use crate::error::{ImporterError, Result};
use crate::export::stats::{ImporterStats, StatsSnapshot};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// `None` when InfluxDB export is disabled.
#[derive(Clone)]
struct AppState {
    stats: Option<Arc<ImporterStats>>,
}

pub struct HttpServer {
    host: String,
    port: u16,
    state: AppState,
}

impl HttpServer {
    /// `host` may be an IP address or a resolvable hostname.
    pub fn new(host: &str, port: u16, stats: Option<Arc<ImporterStats>>) -> Self {
        Self {
            host: host.to_string(),
            port,
            state: AppState { stats },
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let app = router(self.state);

        let listener = tokio::net::TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                ImporterError::Server(format!("cannot bind {}:{}: {e}", self.host, self.port))
            })?;
        let addr = listener
            .local_addr()
            .map_err(|e| ImporterError::Server(e.to_string()))?;

        info!(addr = %addr, "Starting HTTP server");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| ImporterError::Server(e.to_string()))?;

        Ok(())
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/stats", get(stats_handler))
        .route("/", get(root_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Response {
    match &state.stats {
        Some(stats) if stats.has_exited() => {
            (StatusCode::SERVICE_UNAVAILABLE, "Unhealthy - importer stopped").into_response()
        }
        _ => (StatusCode::OK, "OK").into_response(),
    }
}

async fn ready_handler(State(state): State<AppState>) -> Response {
    match &state.stats {
        Some(stats) if !stats.is_ready() => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Not ready - importer not running",
        )
            .into_response(),
        _ => (StatusCode::OK, "Ready").into_response(),
    }
}

async fn stats_handler(State(state): State<AppState>) -> Response {
    match &state.stats {
        Some(stats) => Json::<StatsSnapshot>(stats.snapshot()).into_response(),
        None => (StatusCode::NOT_FOUND, "Export disabled").into_response(),
    }
}

async fn root_handler() -> Response {
    let html = r#"<!DOCTYPE html>
<html>
<head><title>Kafka Lag Importer</title></head>
<body>
<h1>Kafka Lag Importer</h1>
<p><a href="/health">Health</a></p>
<p><a href="/ready">Ready</a></p>
<p><a href="/stats">Importer Stats</a></p>
</body>
</html>"#;

    (
        StatusCode::OK,
        [("content-type", "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}
