use crate::routes::error_json;
use crate::server::AppState;
use axum::extract::Query;
use axum::routing::get;
use axum::{Extension, Json};
use herd_llm::{Capability, ModelQuery, SortKey};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
struct ModelsParams {
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    sort_by: Option<String>,
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    page_size: Option<usize>,
    #[serde(default)]
    capability: Option<String>,
}

impl ModelsParams {
    fn query(&self) -> herd_llm::Result<ModelQuery> {
        let defaults = ModelQuery::default();
        let mut query = ModelQuery {
            sort_by: match self.sort_by.as_deref().filter(|s| !s.trim().is_empty()) {
                Some(key) => key.parse::<SortKey>()?,
                None => defaults.sort_by,
            },
            page: self.page.unwrap_or(defaults.page),
            page_size: self.page_size.unwrap_or(defaults.page_size),
            capability: None,
        };
        if let Some(cap) = self.capability.as_deref().filter(|s| !s.trim().is_empty()) {
            query = query.capability(cap.parse::<Capability>()?);
        }
        Ok(query)
    }
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/models", get(list_models))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_models(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<ModelsParams>,
) -> Json<serde_json::Value> {
    let query = match params.query() {
        Ok(query) => query,
        Err(e) => return error_json(e),
    };
    let kind = match state.resolve_provider(params.provider.as_deref()) {
        Ok(kind) => kind,
        Err(e) => return error_json(e),
    };
    let client = match state.clients.build(kind) {
        Ok(client) => client,
        Err(e) => return error_json(e),
    };
    let models = client.list_models(&query).await;
    Json(serde_json::json!({
        "status": "ok",
        "provider": kind,
        "page": query.page.max(1),
        "page_size": query.page_size,
        "models": models,
    }))
}
