use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/providers", get(list_providers))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_providers(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let providers: Vec<serde_json::Value> = state
        .clients
        .availability()
        .into_iter()
        .map(|(kind, available)| {
            serde_json::json!({
                "name": kind,
                "available": available,
                "api_key_env": kind.api_key_env(),
            })
        })
        .collect();
    Json(serde_json::json!({
        "default": state.config.llm.default_provider,
        "providers": providers,
    }))
}

#[cfg(test)]
mod tests {
    use crate::routes::testing::{body_json, get};
    use crate::server::{router, testing::state};
    use herd_llm::ProviderKind;
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn reports_availability_per_provider() {
        let response = router(state(vec![ProviderKind::Anthropic]))
            .oneshot(get("/api/v1/providers"))
            .await
            .expect("response");
        let body = body_json(response).await;
        assert_eq!(body["default"], json!("ollama"));
        let providers = body["providers"].as_array().expect("providers");
        assert_eq!(providers.len(), ProviderKind::ALL.len());
        let anthropic = providers
            .iter()
            .find(|p| p["name"] == json!("anthropic"))
            .expect("anthropic listed");
        assert_eq!(anthropic["available"], json!(false));
        assert_eq!(anthropic["api_key_env"], json!("ANTHROPIC_API_KEY"));
    }
}
