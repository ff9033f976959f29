pub mod chat;
pub mod health;
pub mod images;
pub mod models;
pub mod providers;
pub mod sessions;

use axum::{Json, Router};
use std::fmt::Display;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(chat::router())
        .merge(models::router())
        .merge(images::router())
        .merge(providers::router())
        .merge(sessions::router())
}

pub(crate) fn error_json(error: impl Display) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "error", "error": error.to_string() }))
}
