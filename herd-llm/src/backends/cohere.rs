use super::openai::{OpenAiChoiceToolCall, to_openai_tool};
use super::str_at;
use crate::backend::{Backend, ChatTurn, require_key};
use crate::catalog::static_model;
use crate::error::Result;
use crate::image::data_url;
use crate::stream::{Delta, DeltaExtractor, WireFormat};
use crate::transport::HttpRequest;
use crate::types::{
    Capability, Content, ContentPart, Message, ModelDescriptor, ToolCall, ToolDefinition,
    ToolResponse,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;

pub const COHERE_CHAT_URL: &str = "https://api.cohere.com/v2/chat";
pub const COHERE_MODELS_URL: &str = "https://api.cohere.com/v1/models?endpoint=chat";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

#[derive(Clone)]
pub struct CohereBackend {
    api_key: String,
}

impl CohereBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    fn authed(&self, request: HttpRequest) -> Result<HttpRequest> {
        let key = require_key("cohere", &self.api_key)?;
        Ok(request.bearer(key))
    }

    fn chat_body(
        &self,
        turn: &ChatTurn<'_>,
        tools: &[ToolDefinition],
        stream: bool,
    ) -> Result<serde_json::Value> {
        let mut messages = Vec::with_capacity(turn.history.len() + 1);
        if let Some(system) = turn.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(turn.history.iter().map(cohere_message));

        let mut body = json!({
            "model": turn.model,
            "messages": messages,
            "max_tokens": turn.max_tokens,
            "stream": stream,
        });
        if let Some(t) = turn.options.temperature {
            body["temperature"] = json!(t);
        }
        if !tools.is_empty() {
            let tools: Vec<_> = tools.iter().map(to_openai_tool).collect();
            body["tools"] = serde_json::to_value(tools)?;
        }
        turn.apply_extra(&mut body);
        Ok(body)
    }
}

fn cohere_message(m: &Message) -> serde_json::Value {
    match &m.content {
        Content::Text(text) => json!({"role": m.role.as_str(), "content": text}),
        Content::Parts(parts) => {
            let content: Vec<serde_json::Value> = parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { value } => json!({"type": "text", "text": value}),
                    ContentPart::Image { data, media_type } => json!({
                        "type": "image_url",
                        "image_url": {"url": data_url(data, media_type)},
                    }),
                })
                .collect();
            json!({"role": m.role.as_str(), "content": content})
        }
    }
}

pub fn extract_delta(event: &serde_json::Value) -> Delta {
    match str_at(event, "/type") {
        Some("content-delta") => match str_at(event, "/delta/message/content/text") {
            Some(text) => Delta::Text(text.to_string()),
            None => Delta::Skip,
        },
        Some("message-end") => Delta::Done,
        _ => Delta::Skip,
    }
}

#[derive(Debug, Deserialize)]
struct CohereChatResponse {
    message: CohereResponseMessage,
}

#[derive(Debug, Deserialize)]
struct CohereResponseMessage {
    #[serde(default)]
    content: Vec<CohereTextBlock>,
    #[serde(default)]
    tool_calls: Vec<OpenAiChoiceToolCall>,
    #[serde(default)]
    tool_plan: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CohereTextBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct CohereModelList {
    #[serde(default)]
    models: Vec<CohereModel>,
}

#[derive(Debug, Deserialize)]
struct CohereModel {
    name: String,
    #[serde(default)]
    endpoints: Vec<String>,
    #[serde(default)]
    context_length: Option<u32>,
}

impl Backend for CohereBackend {
    fn name(&self) -> &'static str {
        "cohere"
    }

    fn default_model(&self) -> &str {
        "command-r-plus-08-2024"
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::Sse
    }

    fn delta_extractor(&self) -> DeltaExtractor {
        extract_delta
    }

    fn default_system_prompt(&self) -> Option<&str> {
        Some(DEFAULT_SYSTEM_PROMPT)
    }

    fn fallback_models(&self) -> Vec<ModelDescriptor> {
        use Capability::*;
        vec![
            static_model(
                "cohere",
                "command-r-plus-08-2024",
                "command-r-plus-08-2024",
                &[Text],
                4096,
                "2024-08-30",
            ),
            static_model("cohere", "command-light", "command-light", &[Text], 4096, ""),
        ]
    }

    fn models_request(&self) -> Result<Option<HttpRequest>> {
        Ok(Some(self.authed(HttpRequest::get(COHERE_MODELS_URL))?))
    }

    fn parse_models(&self, body: &serde_json::Value) -> Result<Vec<ModelDescriptor>> {
        let list: CohereModelList = serde_json::from_value(body.clone())?;
        Ok(list
            .models
            .into_iter()
            .map(|m| {
                let mut capabilities = BTreeSet::new();
                if m.endpoints.iter().any(|e| e == "chat") {
                    capabilities.insert(Capability::Text);
                    capabilities.insert(Capability::Function);
                }
                if m.name.contains("vision") {
                    capabilities.insert(Capability::Vision);
                }
                ModelDescriptor {
                    id: m.name.clone(),
                    display_name: m.name,
                    capabilities,
                    context_length: m.context_length.unwrap_or(4096),
                    created_at: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
                    provider: "cohere".to_string(),
                }
            })
            .collect())
    }

    fn stream_request(&self, turn: &ChatTurn<'_>) -> Result<HttpRequest> {
        let body = self.chat_body(turn, &[], true)?;
        self.authed(HttpRequest::post(COHERE_CHAT_URL, body))
    }

    fn supports_native_tools(&self) -> bool {
        true
    }

    fn tool_request(&self, turn: &ChatTurn<'_>, tools: &[ToolDefinition]) -> Result<HttpRequest> {
        let body = self.chat_body(turn, tools, false)?;
        self.authed(HttpRequest::post(COHERE_CHAT_URL, body))
    }

    fn parse_tool_response(&self, body: &serde_json::Value) -> Result<ToolResponse> {
        let parsed: CohereChatResponse = serde_json::from_value(body.clone())?;
        let mut content: String = parsed
            .message
            .content
            .iter()
            .map(|b| b.text.as_str())
            .collect();
        if content.is_empty() {
            content = parsed.message.tool_plan.unwrap_or_default();
        }
        Ok(ToolResponse {
            content,
            tool_calls: parsed
                .message
                .tool_calls
                .into_iter()
                .map(ToolCall::from)
                .collect(),
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChatOptions;

    #[test]
    fn request_carries_system_history_and_tools() {
        let history = vec![Message::user("weather?")];
        let options = ChatOptions::default();
        let turn = ChatTurn {
            model: "command-r",
            system: Some(DEFAULT_SYSTEM_PROMPT),
            history: &history,
            max_tokens: 300,
            options: &options,
        };
        let tools = vec![ToolDefinition {
            name: "weather".to_string(),
            description: "current weather".to_string(),
            parameters: json!({"type": "object"}),
        }];
        let req = CohereBackend::new("co").tool_request(&turn, &tools).expect("request");
        assert_eq!(req.url, COHERE_CHAT_URL);
        assert_eq!(req.header_value("authorization"), Some("Bearer co"));
        let body = req.body.expect("body");
        assert_eq!(body["stream"], json!(false));
        assert_eq!(body["messages"][0]["role"], json!("system"));
        assert_eq!(body["messages"][1], json!({"role": "user", "content": "weather?"}));
        assert_eq!(body["tools"][0]["function"]["name"], json!("weather"));
    }

    #[test]
    fn tool_plan_fills_empty_content() {
        let resp = CohereBackend::new("co")
            .parse_tool_response(&json!({
                "message": {
                    "role": "assistant",
                    "tool_plan": "I will look up the weather.",
                    "tool_calls": [{"id": "w1", "type": "function", "function": {"name": "weather", "arguments": "{}"}}]
                }
            }))
            .expect("parse");
        assert_eq!(resp.content, "I will look up the weather.");
        assert_eq!(resp.tool_calls[0].id, "w1");
    }

    #[test]
    fn model_listing_reads_endpoints() {
        let models = CohereBackend::new("co")
            .parse_models(&json!({"models": [
                {"name": "command-r", "endpoints": ["generate", "chat"], "context_length": 128000},
                {"name": "embed-english-v3.0", "endpoints": ["embed"]}
            ]}))
            .expect("parse");
        assert!(models[0].supports(Capability::Text));
        assert_eq!(models[0].context_length, 128000);
        assert!(models[1].capabilities.is_empty());
    }
}
