use crate::routes::error_json;
use crate::server::AppState;
use crate::session::SharedClient;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json};
use futures_util::{Stream, StreamExt};
use herd_llm::{
    ChatRequest, ImageInput, ProviderClient, ProviderKind, StreamChunk, ToolDefinition, ToolRequest,
};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;

const SESSION_HEADER: &str = "x-session-id";

#[derive(Debug, Deserialize)]
struct ChatBody {
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
    prompt: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
    /// Base64 or a data URL.
    #[serde(default)]
    image_data: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    system_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClearBody {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ToolsBody {
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
    prompt: String,
    #[serde(default)]
    tools: Vec<ToolDefinition>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    session_id: Option<String>,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/chat/stream", post(chat_stream))
        .route("/api/v1/chat/completions", post(chat_completions))
        .route("/api/v1/chat/clear", post(clear_chat))
        .route("/api/v1/chat/tools", post(chat_tools))
}

struct PreparedChat {
    session_id: String,
    client: SharedClient,
    request: ChatRequest,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn open_session(
    state: &AppState,
    provider: Option<&str>,
    session_id: Option<String>,
) -> anyhow::Result<(String, ProviderKind, SharedClient)> {
    let kind = state.resolve_provider(provider)?;
    let session_id = non_blank(session_id).unwrap_or_else(|| Uuid::new_v4().to_string());
    let make = || -> anyhow::Result<Box<dyn ProviderClient>> { Ok(state.clients.build(kind)?) };
    let client = state.sessions.get_or_create(&session_id, kind, &make)?;
    Ok((session_id, kind, client))
}

fn prepare_chat(state: &AppState, body: ChatBody) -> anyhow::Result<PreparedChat> {
    if body.prompt.trim().is_empty() {
        return Err(anyhow::anyhow!("prompt is required"));
    }
    let (session_id, kind, client) =
        open_session(state, body.provider.as_deref(), body.session_id)?;

    let mut request = ChatRequest::new(body.prompt)
        .model(non_blank(body.model).unwrap_or_else(|| state.config.default_model_for(kind)))
        .max_tokens(body.max_tokens.or(state.config.llm.default_max_tokens));
    if let Some(data) = non_blank(body.image_data) {
        request = request.image(ImageInput::Data(data));
    }
    if let Some(temperature) = body.temperature {
        request = request.temperature(temperature);
    }
    if let Some(system_prompt) = non_blank(body.system_prompt) {
        request = request.system_prompt(system_prompt);
    }
    Ok(PreparedChat {
        session_id,
        client,
        request,
    })
}

fn chunk_event(chunk: &StreamChunk) -> Result<Event, Infallible> {
    Ok(Event::default().data(serde_json::to_string(chunk).unwrap_or_default()))
}

fn done_event() -> Result<Event, Infallible> {
    Ok(Event::default().data("[DONE]"))
}

fn sse<S>(events: S) -> Sse<axum::response::sse::KeepAliveStream<S>>
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[tracing::instrument(level = "info", skip_all)]
async fn chat_stream(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> Response {
    let PreparedChat {
        session_id,
        client,
        request,
    } = match prepare_chat(&state, body) {
        Ok(prepared) => prepared,
        Err(e) => {
            tracing::warn!(error = %e, "chat stream rejected");
            let events = futures_util::stream::iter(vec![
                chunk_event(&StreamChunk::error(e.to_string())),
                done_event(),
            ]);
            return sse(events).into_response();
        }
    };

    tracing::debug!(%session_id, "chat stream opened");
    let events = async_stream::stream! {
        // Held for the whole response; dropping the body mid-stream rolls
        // the turn back.
        let mut client = client.lock_owned().await;
        let mut chunks = client.stream_chat_response(request);
        while let Some(chunk) = chunks.next().await {
            yield chunk_event(&chunk);
        }
        yield done_event();
    };
    ([(SESSION_HEADER, session_id)], sse(events)).into_response()
}

#[tracing::instrument(level = "info", skip_all)]
async fn chat_completions(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> Json<serde_json::Value> {
    let PreparedChat {
        session_id,
        client,
        request,
    } = match prepare_chat(&state, body) {
        Ok(prepared) => prepared,
        Err(e) => return error_json(e),
    };

    let mut client = client.lock().await;
    let mut chunks = client.stream_chat_response(request);
    let mut content = String::new();
    while let Some(chunk) = chunks.next().await {
        match chunk {
            StreamChunk::Content { content: delta } => content.push_str(&delta),
            StreamChunk::Error { error } => {
                return Json(serde_json::json!({
                    "status": "error",
                    "error": error,
                    "session_id": session_id,
                }));
            }
        }
    }
    Json(serde_json::json!({
        "status": "ok",
        "content": content,
        "session_id": session_id,
    }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn clear_chat(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<ClearBody>,
) -> Json<serde_json::Value> {
    let cleared = state.sessions.clear(body.session_id.trim()).await;
    Json(serde_json::json!({ "status": if cleared { "ok" } else { "not_found" } }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn chat_tools(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<ToolsBody>,
) -> Json<serde_json::Value> {
    if body.prompt.trim().is_empty() {
        return error_json("prompt is required");
    }
    let (session_id, kind, client) =
        match open_session(&state, body.provider.as_deref(), body.session_id) {
            Ok(opened) => opened,
            Err(e) => return error_json(e),
        };

    let request = ToolRequest {
        prompt: body.prompt,
        model: non_blank(body.model).unwrap_or_else(|| state.config.default_model_for(kind)),
        tools: body.tools,
        max_tokens: body.max_tokens.or(state.config.llm.default_max_tokens),
    };
    let response = client.lock().await.call_tool(request).await;
    Json(serde_json::json!({
        "status": if response.error.is_some() { "error" } else { "ok" },
        "content": response.content,
        "tool_calls": response.tool_calls,
        "error": response.error,
        "session_id": session_id,
    }))
}
