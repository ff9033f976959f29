use super::str_at;
use crate::backend::{Backend, ChatTurn, require_key};
use crate::catalog::{from_rfc3339, static_model};
use crate::error::Result;
use crate::stream::{Delta, DeltaExtractor, WireFormat};
use crate::transport::HttpRequest;
use crate::types::{
    Capability, Content, ContentPart, Message, ModelDescriptor, Role, ToolCall, ToolDefinition,
    ToolResponse,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Output ceiling enforced for every Anthropic model.
pub const ANTHROPIC_MAX_TOKENS: u32 = 4096;

#[derive(Clone)]
pub struct AnthropicBackend {
    api_key: String,
    base_url: String,
}

impl AnthropicBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: ANTHROPIC_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn authed(&self, request: HttpRequest) -> Result<HttpRequest> {
        let key = require_key("anthropic", &self.api_key)?;
        Ok(request
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION))
    }

    fn messages_request(
        &self,
        turn: &ChatTurn<'_>,
        tools: &[ToolDefinition],
        stream: bool,
    ) -> Result<HttpRequest> {
        let req = AnthropicRequest::new(turn, tools, stream);
        let mut body = serde_json::to_value(req)?;
        turn.apply_extra(&mut body);
        self.authed(HttpRequest::post(format!("{}/messages", self.base_url), body))
    }
}

pub fn extract_delta(event: &serde_json::Value) -> Delta {
    match str_at(event, "/type") {
        Some("content_block_delta") => match str_at(event, "/delta/text") {
            Some(text) => Delta::Text(text.to_string()),
            None => Delta::Skip,
        },
        Some("message_stop") => Delta::Done,
        Some("error") => Delta::Error(format!(
            "anthropic stream error: {}",
            str_at(event, "/error/message").unwrap_or("unknown error")
        )),
        _ => Delta::Skip,
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

impl AnthropicRequest {
    fn new(turn: &ChatTurn<'_>, tools: &[ToolDefinition], stream: bool) -> Self {
        Self {
            model: turn.model.to_string(),
            max_tokens: turn.max_tokens,
            system: turn.system.map(|s| s.trim().to_string()),
            messages: turn
                .history
                .iter()
                .filter(|m| m.role != Role::System)
                .map(to_anthropic_message)
                .collect(),
            temperature: turn.options.temperature,
            tools: tools.iter().map(to_anthropic_tool).collect(),
            stream: if stream { Some(true) } else { None },
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

fn to_anthropic_tool(t: &ToolDefinition) -> AnthropicTool {
    AnthropicTool {
        name: t.name.clone(),
        description: t.description.clone(),
        input_schema: t.parameters.clone(),
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    Image {
        source: AnthropicImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnthropicImageSource {
    r#type: String,
    media_type: String,
    data: String,
}

fn to_anthropic_message(m: &Message) -> AnthropicMessage {
    let role = match m.role {
        Role::Assistant => "assistant",
        _ => "user",
    };
    let content = match &m.content {
        Content::Text(text) => vec![AnthropicContentBlock::Text { text: text.clone() }],
        Content::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { value } => AnthropicContentBlock::Text {
                    text: value.clone(),
                },
                ContentPart::Image { data, media_type } => AnthropicContentBlock::Image {
                    source: AnthropicImageSource {
                        r#type: "base64".to_string(),
                        media_type: media_type.clone(),
                        data: data.clone(),
                    },
                },
            })
            .collect(),
    };
    AnthropicMessage {
        role: role.to_string(),
        content,
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
}

impl TryFrom<AnthropicResponse> for ToolResponse {
    type Error = crate::error::LlmError;

    fn try_from(v: AnthropicResponse) -> Result<Self> {
        let mut content = String::new();
        let mut tool_calls = Vec::new();

        for block in v.content {
            match block {
                AnthropicContentBlock::Text { text } => content.push_str(&text),
                AnthropicContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall {
                        id,
                        function_name: name,
                        arguments_json: serde_json::to_string(&input)?,
                    });
                }
                AnthropicContentBlock::Image { .. } | AnthropicContentBlock::Unknown => {}
            }
        }

        Ok(ToolResponse {
            content,
            tool_calls,
            error: None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicModelList {
    #[serde(default)]
    data: Vec<AnthropicModel>,
}

#[derive(Debug, Deserialize)]
struct AnthropicModel {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

fn infer_capabilities(id: &str) -> BTreeSet<Capability> {
    let mut caps = BTreeSet::from([Capability::Text]);
    let legacy = id.starts_with("claude-2") || id.starts_with("claude-instant");
    if !legacy {
        caps.insert(Capability::Vision);
        caps.insert(Capability::Function);
    }
    caps
}

impl Backend for AnthropicBackend {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        "claude-3-haiku-20240307"
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::Sse
    }

    fn delta_extractor(&self) -> DeltaExtractor {
        extract_delta
    }

    fn max_tokens_ceiling(&self) -> Option<u32> {
        Some(ANTHROPIC_MAX_TOKENS)
    }

    fn fallback_models(&self) -> Vec<ModelDescriptor> {
        use Capability::*;
        vec![
            static_model(
                "anthropic",
                "claude-3-opus-20240229",
                "Claude 3 Opus",
                &[Text, Vision, Function],
                200_000,
                "2024-02-29",
            ),
            static_model(
                "anthropic",
                "claude-3-sonnet-20240229",
                "Claude 3 Sonnet",
                &[Text, Vision, Function],
                200_000,
                "2024-02-29",
            ),
            static_model(
                "anthropic",
                "claude-3-haiku-20240307",
                "Claude 3 Haiku",
                &[Text, Vision],
                200_000,
                "2024-03-07",
            ),
        ]
    }

    fn models_request(&self) -> Result<Option<HttpRequest>> {
        Ok(Some(self.authed(HttpRequest::get(format!("{}/models", self.base_url)))?))
    }

    fn parse_models(&self, body: &serde_json::Value) -> Result<Vec<ModelDescriptor>> {
        let list: AnthropicModelList = serde_json::from_value(body.clone())?;
        Ok(list
            .data
            .into_iter()
            .filter(|m| m.id.starts_with("claude"))
            .map(|m| ModelDescriptor {
                display_name: m.display_name.unwrap_or_else(|| m.id.clone()),
                capabilities: infer_capabilities(&m.id),
                context_length: 200000,
                created_at: m
                    .created_at
                    .as_deref()
                    .map(from_rfc3339)
                    .unwrap_or(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH),
                provider: "anthropic".to_string(),
                id: m.id,
            })
            .collect())
    }

    fn stream_request(&self, turn: &ChatTurn<'_>) -> Result<HttpRequest> {
        self.messages_request(turn, &[], true)
    }

    fn supports_native_tools(&self) -> bool {
        true
    }

    fn tool_request(&self, turn: &ChatTurn<'_>, tools: &[ToolDefinition]) -> Result<HttpRequest> {
        self.messages_request(turn, tools, false)
    }

    fn parse_tool_response(&self, body: &serde_json::Value) -> Result<ToolResponse> {
        let parsed: AnthropicResponse = serde_json::from_value(body.clone())?;
        parsed.try_into()
    }
}
