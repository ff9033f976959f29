use crate::routes::error_json;
use crate::server::AppState;
use axum::routing::post;
use axum::{Extension, Json};
use herd_llm::ImageGenerationRequest;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct GenerateBody {
    #[serde(default)]
    provider: Option<String>,
    #[serde(flatten)]
    request: ImageGenerationRequest,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/images/generate", post(generate_image))
}

#[tracing::instrument(level = "info", skip_all)]
async fn generate_image(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<GenerateBody>,
) -> Json<serde_json::Value> {
    if body.request.prompt.trim().is_empty() {
        return error_json("prompt is required");
    }
    let kind = match state.resolve_provider(body.provider.as_deref()) {
        Ok(kind) => kind,
        Err(e) => return error_json(e),
    };
    let client = match state.clients.build(kind) {
        Ok(client) => client,
        Err(e) => return error_json(e),
    };
    match client.generate_image(body.request).await {
        Ok(generated) => Json(serde_json::json!({
            "status": "ok",
            "provider": kind,
            "created": generated.created,
            "model": generated.model,
            "images": generated.images,
        })),
        Err(e) => {
            tracing::warn!(provider = %kind, error = %e, "image generation failed");
            error_json(e)
        }
    }
}
