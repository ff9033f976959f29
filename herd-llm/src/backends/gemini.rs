use super::str_at;
use crate::backend::{Backend, ChatTurn, require_key};
use crate::catalog::static_model;
use crate::error::Result;
use crate::stream::{Delta, DeltaExtractor, WireFormat};
use crate::transport::HttpRequest;
use crate::types::{
    Capability, Content, ContentPart, Message, ModelDescriptor, Role, ToolCall, ToolDefinition,
    ToolResponse,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Clone)]
pub struct GeminiBackend {
    api_key: String,
    base_url: String,
}

impl GeminiBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }

    fn authed(&self, request: HttpRequest) -> Result<HttpRequest> {
        let key = require_key("gemini", &self.api_key)?;
        Ok(request.header("x-goog-api-key", key))
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!("{}/models/{model}:{method}", self.base_url)
    }

    fn generate_body(&self, turn: &ChatTurn<'_>, tools: &[ToolDefinition]) -> serde_json::Value {
        let contents: Vec<serde_json::Value> = turn
            .history
            .iter()
            .filter(|m| m.role != Role::System)
            .map(gemini_content)
            .collect();

        let mut generation_config = json!({ "maxOutputTokens": turn.max_tokens });
        if let Some(t) = turn.options.temperature {
            generation_config["temperature"] = json!(t);
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        if let Some(system) = turn.system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        if !tools.is_empty() {
            let declarations: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
        turn.apply_extra(&mut body);
        body
    }
}

fn gemini_content(m: &Message) -> serde_json::Value {
    let role = match m.role {
        Role::Assistant => "model",
        _ => "user",
    };
    let parts: Vec<serde_json::Value> = match &m.content {
        Content::Text(text) => vec![json!({ "text": text })],
        Content::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { value } => json!({ "text": value }),
                ContentPart::Image { data, media_type } => {
                    json!({ "inline_data": { "mime_type": media_type, "data": data } })
                }
            })
            .collect(),
    };
    json!({ "role": role, "parts": parts })
}

pub fn extract_delta(event: &serde_json::Value) -> Delta {
    if let Some(message) = str_at(event, "/error/message") {
        return Delta::Error(format!("gemini stream error: {message}"));
    }
    let Some(parts) = event
        .pointer("/candidates/0/content/parts")
        .and_then(serde_json::Value::as_array)
    else {
        return Delta::Skip;
    };
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(serde_json::Value::as_str))
        .collect();
    if text.is_empty() {
        Delta::Skip
    } else {
        Delta::Text(text)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiModelList {
    #[serde(default)]
    models: Vec<GeminiModel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiModel {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    input_token_limit: Option<u32>,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

fn infer_capabilities(id: &str) -> BTreeSet<Capability> {
    let mut caps = BTreeSet::from([Capability::Text, Capability::Function]);
    if !id.contains("1.0") {
        caps.insert(Capability::Vision);
    }
    if id.contains("image-generation") {
        caps.insert(Capability::ImageGeneration);
    }
    caps
}

impl Backend for GeminiBackend {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn default_model(&self) -> &str {
        "gemini-2.0-flash"
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::Sse
    }

    fn delta_extractor(&self) -> DeltaExtractor {
        extract_delta
    }

    fn fallback_models(&self) -> Vec<ModelDescriptor> {
        use Capability::*;
        vec![
            static_model(
                "gemini",
                "gemini-2.0-flash",
                "Gemini 2.0 Flash",
                &[Text, Function],
                32768,
                "2024-02-01",
            ),
            static_model(
                "gemini",
                "gemini-1.5-pro",
                "Gemini 1.5 Pro",
                &[Text, Vision, Function],
                128_000,
                "2024-02-01",
            ),
            static_model(
                "gemini",
                "gemini-2.0-flash-exp",
                "Gemini 2.0 Flash Experimental",
                &[Text, Vision, Function],
                32768,
                "2024-03-12",
            ),
            static_model(
                "gemini",
                "gemini-2.0-flash-exp-image-generation",
                "Gemini 2.0 Flash Image Generation",
                &[Text, Vision, Function, ImageGeneration],
                32768,
                "2024-03-12",
            ),
        ]
    }

    fn models_request(&self) -> Result<Option<HttpRequest>> {
        Ok(Some(self.authed(HttpRequest::get(format!("{}/models", self.base_url)))?))
    }

    fn parse_models(&self, body: &serde_json::Value) -> Result<Vec<ModelDescriptor>> {
        let list: GeminiModelList = serde_json::from_value(body.clone())?;
        Ok(list
            .models
            .into_iter()
            .filter(|m| m.supported_generation_methods.iter().any(|g| g == "generateContent"))
            .map(|m| {
                let id = m.name.strip_prefix("models/").unwrap_or(&m.name).to_string();
                ModelDescriptor {
                    display_name: m.display_name.unwrap_or_else(|| id.clone()),
                    capabilities: infer_capabilities(&id),
                    context_length: m.input_token_limit.unwrap_or(32768),
                    created_at: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
                    provider: "gemini".to_string(),
                    id,
                }
            })
            .collect())
    }

    fn stream_request(&self, turn: &ChatTurn<'_>) -> Result<HttpRequest> {
        let url = format!("{}?alt=sse", self.model_url(turn.model, "streamGenerateContent"));
        self.authed(HttpRequest::post(url, self.generate_body(turn, &[])))
    }

    fn supports_native_tools(&self) -> bool {
        true
    }

    fn tool_request(&self, turn: &ChatTurn<'_>, tools: &[ToolDefinition]) -> Result<HttpRequest> {
        let url = self.model_url(turn.model, "generateContent");
        self.authed(HttpRequest::post(url, self.generate_body(turn, tools)))
    }

    fn parse_tool_response(&self, body: &serde_json::Value) -> Result<ToolResponse> {
        let parts = body
            .pointer("/candidates/0/content/parts")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| {
                let message = "gemini response missing candidates".to_string();
                crate::error::LlmError::ResponseFormat(message)
            })?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for part in parts {
            if let Some(text) = part.get("text").and_then(serde_json::Value::as_str) {
                content.push_str(text);
            }
            if let Some(call) = part.get("functionCall") {
                tool_calls.push(ToolCall {
                    id: format!("call_{}", tool_calls.len()),
                    function_name: str_at(call, "/name").unwrap_or_default().to_string(),
                    arguments_json: call
                        .get("args")
                        .map(serde_json::Value::to_string)
                        .unwrap_or_else(|| "{}".to_string()),
                });
            }
        }
        Ok(ToolResponse {
            content,
            tool_calls,
            error: None,
        })
    }
}
