use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let default_provider = state.config.llm.default_provider;
    let default_ready = state
        .clients
        .availability()
        .get(&default_provider)
        .copied()
        .unwrap_or(false);

    Json(serde_json::json!({
        "status": if default_ready { "ok" } else { "degraded" },
        "ready": default_ready,
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "sessions": state.sessions.len(),
        "default_provider": default_provider,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
