//! OpenAI chat completions, and the vendors that speak the same dialect
//! (Mistral, X.AI, Perplexity, and a local LM Studio server).

use super::str_at;
use crate::backend::{Backend, ChatTurn, require_key};
use crate::catalog::{from_unix, static_model};
use crate::error::{LlmError, Result};
use crate::image::data_url;
use crate::stream::{Delta, DeltaExtractor, WireFormat};
use crate::transport::HttpRequest;
use crate::types::{
    Capability, Content, ContentPart, GeneratedImage, ImageGeneration, ImageGenerationRequest,
    Message, ModelDescriptor, ToolCall, ToolDefinition, ToolResponse,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";
pub const XAI_BASE_URL: &str = "https://api.x.ai/v1";
pub const PERPLEXITY_BASE_URL: &str = "https://api.perplexity.ai";
pub const LMSTUDIO_BASE_URL: &str = "http://localhost:1234/v1";

const PERPLEXITY_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant focused on accurate and insightful responses.";

const OPENAI_IMAGE_SIZES: [&str; 5] = ["256x256", "512x512", "1024x1024", "1792x1024", "1024x1792"];
const XAI_IMAGE_SIZES: [&str; 3] = ["1024x1024", "1024x1792", "1792x1024"];
const DEFAULT_IMAGE_SIZE: &str = "1024x1024";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    OpenAi,
    Mistral,
    Xai,
    Perplexity,
    LmStudio,
}

impl Flavor {
    pub fn name(&self) -> &'static str {
        match self {
            Flavor::OpenAi => "openai",
            Flavor::Mistral => "mistral",
            Flavor::Xai => "xai",
            Flavor::Perplexity => "perplexity",
            Flavor::LmStudio => "lmstudio",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Flavor::OpenAi => OPENAI_BASE_URL,
            Flavor::Mistral => MISTRAL_BASE_URL,
            Flavor::Xai => XAI_BASE_URL,
            Flavor::Perplexity => PERPLEXITY_BASE_URL,
            Flavor::LmStudio => LMSTUDIO_BASE_URL,
        }
    }

    /// A local LM Studio server takes no credentials.
    pub fn requires_key(&self) -> bool {
        !matches!(self, Flavor::LmStudio)
    }

    fn native_tools(&self) -> bool {
        matches!(self, Flavor::OpenAi | Flavor::Mistral | Flavor::Xai)
    }

    fn default_image_model(&self) -> Option<&'static str> {
        match self {
            Flavor::OpenAi => Some("dall-e-3"),
            Flavor::Xai => Some("grok-2-image"),
            Flavor::Mistral | Flavor::Perplexity | Flavor::LmStudio => None,
        }
    }
}

#[derive(Clone)]
pub struct OpenAiCompatible {
    flavor: Flavor,
    api_key: String,
    base_url: String,
}

impl OpenAiCompatible {
    pub fn new(flavor: Flavor, api_key: impl Into<String>) -> Self {
        Self {
            flavor,
            api_key: api_key.into(),
            base_url: flavor.default_base_url().to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn authed(&self, request: HttpRequest) -> Result<HttpRequest> {
        if !self.flavor.requires_key() {
            return Ok(request);
        }
        let key = require_key(self.flavor.name(), &self.api_key)?;
        Ok(request.bearer(key))
    }

    fn chat_body(
        &self,
        turn: &ChatTurn<'_>,
        tools: &[ToolDefinition],
        stream: bool,
    ) -> Result<serde_json::Value> {
        let req = OpenAiChatRequest::new(turn, tools, stream);
        let mut body = serde_json::to_value(req)?;
        turn.apply_extra(&mut body);
        Ok(body)
    }
}

pub fn extract_delta(event: &serde_json::Value) -> Delta {
    if let Some(error) = event.get("error") {
        let message = str_at(error, "/message")
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Delta::Error(format!("stream error: {message}"));
    }
    match str_at(event, "/choices/0/delta/content") {
        Some(text) => Delta::Text(text.to_string()),
        None => Delta::Skip,
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    stream: bool,
}

impl OpenAiChatRequest {
    fn new(turn: &ChatTurn<'_>, tools: &[ToolDefinition], stream: bool) -> Self {
        let mut messages = Vec::with_capacity(turn.history.len() + 1);
        if let Some(system) = turn.system {
            messages.push(to_openai_message(&Message::system(system)));
        }
        messages.extend(turn.history.iter().map(to_openai_message));

        let tools: Vec<OpenAiTool> = tools.iter().map(to_openai_tool).collect();
        let tool_choice = if tools.is_empty() {
            None
        } else {
            Some("auto".to_string())
        };

        Self {
            model: turn.model.to_string(),
            messages,
            max_tokens: turn.max_tokens,
            temperature: turn.options.temperature,
            tools,
            tool_choice,
            stream,
        }
    }
}

#[derive(Debug, Serialize)]
pub(super) struct OpenAiTool {
    r#type: String,
    function: OpenAiToolFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

pub(super) fn to_openai_tool(t: &ToolDefinition) -> OpenAiTool {
    OpenAiTool {
        r#type: "function".to_string(),
        function: OpenAiToolFunction {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        },
    }
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: OpenAiContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAiPart {
    Text { text: String },
    ImageUrl { image_url: OpenAiImageUrl },
}

#[derive(Debug, Serialize)]
struct OpenAiImageUrl {
    url: String,
}

fn to_openai_message(m: &Message) -> OpenAiMessage {
    let content = match &m.content {
        Content::Text(text) => OpenAiContent::Text(text.clone()),
        Content::Parts(parts) => OpenAiContent::Parts(
            parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { value } => OpenAiPart::Text {
                        text: value.clone(),
                    },
                    ContentPart::Image { data, media_type } => OpenAiPart::ImageUrl {
                        image_url: OpenAiImageUrl {
                            url: data_url(data, media_type),
                        },
                    },
                })
                .collect(),
        ),
    };
    OpenAiMessage {
        role: m.role.as_str().to_string(),
        content,
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiChoiceToolCall>,
}

#[derive(Debug, Deserialize)]
pub(super) struct OpenAiChoiceToolCall {
    #[serde(default)]
    id: String,
    #[serde(default)]
    function: OpenAiChoiceToolCallFunction,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiChoiceToolCallFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

impl From<OpenAiChoiceToolCall> for ToolCall {
    fn from(tc: OpenAiChoiceToolCall) -> Self {
        ToolCall {
            id: tc.id,
            function_name: tc.function.name,
            arguments_json: tc.function.arguments,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiModelList {
    #[serde(default)]
    data: Vec<OpenAiModel>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModel {
    id: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    max_context_length: Option<u32>,
    #[serde(default)]
    context_window: Option<u32>,
    /// Mistral reports capabilities explicitly.
    #[serde(default)]
    capabilities: Option<MistralCapabilities>,
}

#[derive(Debug, Deserialize)]
struct MistralCapabilities {
    #[serde(default)]
    completion_chat: bool,
    #[serde(default)]
    function_calling: bool,
    #[serde(default)]
    vision: bool,
}

fn infer_capabilities(id: &str) -> BTreeSet<Capability> {
    let id = id.to_ascii_lowercase();
    if id.contains("dall-e") || id.contains("-image") {
        let mut caps = BTreeSet::from([Capability::ImageGeneration]);
        if id.starts_with("grok") {
            caps.extend([Capability::Text, Capability::Function, Capability::Vision]);
        }
        return caps;
    }
    let mut caps = BTreeSet::from([Capability::Text]);
    if id.contains("vision") || id.contains("4o") || id.contains("pixtral") {
        caps.insert(Capability::Vision);
    }
    if !["instruct", "base", "embedding", "embed"]
        .iter()
        .any(|x| id.contains(x))
    {
        caps.insert(Capability::Function);
    }
    if id.contains("audio") || id.contains("whisper") || id.contains("tts") {
        caps.insert(Capability::Audio);
    }
    caps
}

fn infer_context_length(id: &str) -> u32 {
    if id.contains("32k") {
        32768
    } else if id.contains("16k") {
        16385
    } else if ["128k", "vision", "4o", "turbo"].iter().any(|tag| id.contains(tag)) {
        128_000
    } else {
        8192
    }
}

impl OpenAiModel {
    fn into_descriptor(self, provider: &str) -> ModelDescriptor {
        let capabilities = match &self.capabilities {
            Some(c) => {
                let mut caps = BTreeSet::new();
                if c.completion_chat {
                    caps.insert(Capability::Text);
                }
                if c.function_calling {
                    caps.insert(Capability::Function);
                }
                if c.vision {
                    caps.insert(Capability::Vision);
                }
                caps
            }
            None => infer_capabilities(&self.id),
        };
        let context_length = self
            .max_context_length
            .or(self.context_window)
            .unwrap_or_else(|| infer_context_length(&self.id));
        ModelDescriptor {
            display_name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            id: self.id,
            capabilities,
            context_length,
            created_at: from_unix(self.created),
            provider: provider.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiImageResponse {
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    data: Vec<GeneratedImage>,
}

impl Backend for OpenAiCompatible {
    fn name(&self) -> &'static str {
        self.flavor.name()
    }

    fn default_model(&self) -> &str {
        match self.flavor {
            Flavor::OpenAi => "gpt-4o-2024-11-20",
            Flavor::Mistral => "mistral-small",
            Flavor::Xai => "grok-2-latest",
            Flavor::Perplexity => "sonar",
            Flavor::LmStudio => "mistral-7b-instruct",
        }
    }

    fn default_system_prompt(&self) -> Option<&str> {
        match self.flavor {
            Flavor::Perplexity => Some(PERPLEXITY_SYSTEM_PROMPT),
            _ => None,
        }
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::Sse
    }

    fn delta_extractor(&self) -> DeltaExtractor {
        extract_delta
    }

    fn fallback_models(&self) -> Vec<ModelDescriptor> {
        use Capability::*;
        let p = self.flavor.name();
        match self.flavor {
            Flavor::OpenAi => vec![
                static_model(
                    p,
                    "gpt-4o-2024-11-20",
                    "GPT-4 Omega (gpt-4o-2024-11-20)",
                    &[Text, Function],
                    128_000,
                    "2024-11-20",
                ),
                static_model(
                    p,
                    "gpt-4-vision-preview",
                    "GPT-4 Vision (gpt-4-vision-preview)",
                    &[Text, Vision, Function],
                    128_000,
                    "2023-10-30",
                ),
                static_model(
                    p,
                    "gpt-4-0125-preview",
                    "GPT-4 Turbo (gpt-4-0125-preview)",
                    &[Text, Function],
                    128_000,
                    "2024-01-25",
                ),
                static_model(p, "gpt-4", "GPT-4 (gpt-4)", &[Text, Function], 8192, "2023-03-15"),
                static_model(
                    p,
                    "gpt-3.5-turbo-0125",
                    "GPT-3.5 Turbo (gpt-3.5-turbo-0125)",
                    &[Text, Function],
                    16385,
                    "2024-01-25",
                ),
            ],
            Flavor::Mistral => vec![
                static_model(p, "mistral-tiny", "Mistral Tiny", &[Text], 32768, "2024-03-01"),
                static_model(
                    p,
                    "mistral-small",
                    "Mistral Small",
                    &[Text, Function],
                    32768,
                    "2024-03-01",
                ),
                static_model(
                    p,
                    "mistral-medium",
                    "Mistral Medium",
                    &[Text, Function],
                    32768,
                    "2024-03-01",
                ),
                static_model(
                    p,
                    "pixtral-large-2411",
                    "Pixtral Large",
                    &[Text, Function, Vision],
                    32768,
                    "2024-05-01",
                ),
            ],
            Flavor::Xai => vec![
                static_model(
                    p,
                    "grok-2-latest",
                    "Grok 2 Latest",
                    &[Text, Function, Vision],
                    8192,
                    "2024-02-01",
                ),
                static_model(p, "grok-1", "Grok 1", &[Text, Function], 8192, "2023-11-01"),
                static_model(
                    p,
                    "grok-2-image",
                    "Grok 2 Image",
                    &[Text, Function, Vision, ImageGeneration],
                    8192,
                    "2024-03-01",
                ),
            ],
            Flavor::Perplexity => vec![
                static_model(
                    p,
                    "sonar-deep-research",
                    "Sonar Deep Research",
                    &[Text],
                    60000,
                    "2025-02-15",
                ),
                static_model(
                    p,
                    "sonar-reasoning-pro",
                    "Sonar Reasoning Pro",
                    &[Text],
                    128_000,
                    "2025-02-15",
                ),
                static_model(
                    p,
                    "sonar-reasoning",
                    "Sonar Reasoning",
                    &[Text],
                    128_000,
                    "2025-01-29",
                ),
                static_model(p, "sonar-pro", "Sonar Pro", &[Text], 200_000, "2025-01-29"),
                static_model(p, "sonar", "Sonar", &[Text], 128_000, "2025-01-29"),
                static_model(p, "r1-1776", "R1 1776", &[Text], 128_000, "2025-02-15"),
            ],
            // Whatever the local server has loaded.
            Flavor::LmStudio => Vec::new(),
        }
    }

    fn models_request(&self) -> Result<Option<HttpRequest>> {
        if self.flavor == Flavor::Perplexity {
            return Ok(None);
        }
        Ok(Some(self.authed(HttpRequest::get(self.url("models")))?))
    }

    fn parse_models(&self, body: &serde_json::Value) -> Result<Vec<ModelDescriptor>> {
        let list: OpenAiModelList = serde_json::from_value(body.clone())?;
        Ok(list
            .data
            .into_iter()
            .map(|m| m.into_descriptor(self.flavor.name()))
            .collect())
    }

    fn stream_request(&self, turn: &ChatTurn<'_>) -> Result<HttpRequest> {
        let body = self.chat_body(turn, &[], true)?;
        self.authed(HttpRequest::post(self.url("chat/completions"), body))
    }

    fn supports_native_tools(&self) -> bool {
        self.flavor.native_tools()
    }

    fn tool_request(&self, turn: &ChatTurn<'_>, tools: &[ToolDefinition]) -> Result<HttpRequest> {
        let body = self.chat_body(turn, tools, false)?;
        self.authed(HttpRequest::post(self.url("chat/completions"), body))
    }

    fn parse_tool_response(&self, body: &serde_json::Value) -> Result<ToolResponse> {
        let parsed: OpenAiChatResponse = serde_json::from_value(body.clone())?;
        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            LlmError::ResponseFormat(format!("{} response missing choices", self.name()))
        })?;
        Ok(ToolResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice
                .message
                .tool_calls
                .into_iter()
                .map(ToolCall::from)
                .collect(),
            error: None,
        })
    }

    fn image_request(&self, request: &ImageGenerationRequest) -> Result<HttpRequest> {
        let Some(default_model) = self.flavor.default_image_model() else {
            return Err(LlmError::Unsupported(format!(
                "{} does not generate images",
                self.name()
            )));
        };
        if request.prompt.trim().is_empty() {
            return Err(LlmError::InvalidInput("image prompt is empty".to_string()));
        }

        let valid_sizes: &[&str] = match self.flavor {
            Flavor::Xai => &XAI_IMAGE_SIZES,
            _ => &OPENAI_IMAGE_SIZES,
        };
        let size = if valid_sizes.contains(&request.size.as_str()) {
            request.size.as_str()
        } else {
            tracing::warn!(
                provider = self.name(),
                size = %request.size,
                "invalid image size; using {DEFAULT_IMAGE_SIZE}"
            );
            DEFAULT_IMAGE_SIZE
        };

        let mut body = serde_json::json!({
            "model": request.model.as_deref().unwrap_or(default_model),
            "prompt": request.prompt,
            "n": request.n.max(1),
            "response_format": request.response_format,
        });
        // X.AI rejects the size parameter.
        if self.flavor == Flavor::OpenAi {
            body["size"] = serde_json::Value::String(size.to_string());
        }
        self.authed(HttpRequest::post(self.url("images/generations"), body))
    }

    fn parse_image_response(
        &self,
        body: &serde_json::Value,
        request: &ImageGenerationRequest,
    ) -> Result<ImageGeneration> {
        let parsed: OpenAiImageResponse = serde_json::from_value(body.clone())?;
        if parsed.data.is_empty() {
            return Err(LlmError::ResponseFormat(format!(
                "no image data was generated by {}",
                self.name()
            )));
        }
        let model = request
            .model
            .clone()
            .or_else(|| self.flavor.default_image_model().map(str::to_string))
            .unwrap_or_default();
        Ok(ImageGeneration {
            created: parsed
                .created
                .map(from_unix)
                .unwrap_or_else(chrono::Utc::now),
            model,
            images: parsed.data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChatOptions;
    use serde_json::json;

    fn turn<'a>(history: &'a [Message], options: &'a ChatOptions) -> ChatTurn<'a> {
        ChatTurn {
            model: "gpt-4o",
            system: Some("be brief"),
            history,
            max_tokens: 256,
            options,
        }
    }

    #[test]
    fn stream_request_renders_messages_images_and_extra() {
        let history = vec![Message::user(Content::Parts(vec![
            ContentPart::text("what is this"),
            ContentPart::Image {
                data: "AAAA".to_string(),
                media_type: "image/png".to_string(),
            },
        ]))];
        let mut options = ChatOptions {
            temperature: Some(0.5),
            ..ChatOptions::default()
        };
        options.extra.insert("seed".to_string(), json!(7));

        let backend = OpenAiCompatible::new(Flavor::OpenAi, "sk-test");
        let req = backend
            .stream_request(&turn(&history, &options))
            .expect("request");
        assert_eq!(req.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(req.header_value("authorization"), Some("Bearer sk-test"));

        let body = req.body.expect("body");
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["max_tokens"], json!(256));
        assert_eq!(body["seed"], json!(7));
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(
            body["messages"][1]["content"][1],
            json!({"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}})
        );
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let backend = OpenAiCompatible::new(Flavor::Mistral, "");
        let options = ChatOptions::default();
        let err = backend
            .stream_request(&turn(&[], &options))
            .err()
            .expect("missing key");
        assert!(matches!(err, LlmError::Config(_)));
    }

    #[test]
    fn tool_response_is_parsed_into_tool_calls() {
        let backend = OpenAiCompatible::new(Flavor::Xai, "key");
        let resp = backend
            .parse_tool_response(&json!({
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}
                        }]
                    }
                }]
            }))
            .expect("parse");
        assert_eq!(resp.content, "");
        assert_eq!(
            resp.tool_calls,
            vec![ToolCall {
                id: "call_1".to_string(),
                function_name: "get_weather".to_string(),
                arguments_json: "{\"city\":\"Oslo\"}".to_string(),
            }]
        );
        assert!(backend.parse_tool_response(&json!({"choices": []})).is_err());
    }

    #[test]
    fn model_listing_infers_or_reads_capabilities() {
        let openai = OpenAiCompatible::new(Flavor::OpenAi, "key");
        let models = openai
            .parse_models(&json!({"data": [
                {"id": "gpt-4o", "created": 1715367049, "owned_by": "system"},
                {"id": "dall-e-3", "created": 1698785189},
                {"id": "text-embedding-3-small", "created": 1705948997}
            ]}))
            .expect("parse");
        assert_eq!(models.len(), 3);
        assert!(models[0].supports(Capability::Vision));
        assert!(models[0].supports(Capability::Function));
        assert_eq!(models[0].context_length, 128000);
        assert_eq!(
            models[1].capabilities,
            BTreeSet::from([Capability::ImageGeneration])
        );
        assert!(!models[2].supports(Capability::Function));

        let mistral = OpenAiCompatible::new(Flavor::Mistral, "key");
        let models = mistral
            .parse_models(&json!({"data": [{
                "id": "pixtral-12b", "created": 1, "name": "Pixtral", "max_context_length": 131072,
                "capabilities": {"completion_chat": true, "function_calling": false, "vision": true}
            }]}))
            .expect("parse");
        assert_eq!(models[0].display_name, "Pixtral");
        assert_eq!(models[0].context_length, 131072);
        assert_eq!(
            models[0].capabilities,
            BTreeSet::from([Capability::Text, Capability::Vision])
        );
    }

    #[test]
    fn image_request_validates_size_per_vendor() {
        let mut request = ImageGenerationRequest::new("a lighthouse");
        request.size = "999x999".to_string();

        let openai = OpenAiCompatible::new(Flavor::OpenAi, "key");
        let body = openai.image_request(&request).expect("openai").body.expect("body");
        assert_eq!(body["size"], json!("1024x1024"));
        assert_eq!(body["model"], json!("dall-e-3"));

        let xai = OpenAiCompatible::new(Flavor::Xai, "key");
        let req = xai.image_request(&request).expect("xai");
        assert_eq!(req.url, "https://api.x.ai/v1/images/generations");
        let body = req.body.expect("body");
        assert!(body.get("size").is_none());
        assert_eq!(body["model"], json!("grok-2-image"));

        let mistral = OpenAiCompatible::new(Flavor::Mistral, "key");
        assert!(matches!(
            mistral.image_request(&request),
            Err(LlmError::Unsupported(_))
        ));
    }

    #[test]
    fn image_response_requires_data() {
        let xai = OpenAiCompatible::new(Flavor::Xai, "key");
        let request = ImageGenerationRequest::new("a fox");
        let generated = xai
            .parse_image_response(
                &json!({"created": 1700000000, "data": [{"url": "https://img/1.png", "revised_prompt": "a red fox"}]}),
                &request,
            )
            .expect("parse");
        assert_eq!(generated.model, "grok-2-image");
        assert_eq!(generated.images.len(), 1);
        assert_eq!(generated.images[0].url.as_deref(), Some("https://img/1.png"));
        assert!(xai.parse_image_response(&json!({"data": []}), &request).is_err());
    }

    #[test]
    fn perplexity_uses_static_models_and_its_own_system_prompt() {
        let backend = OpenAiCompatible::new(Flavor::Perplexity, "pplx-key");
        let options = ChatOptions::default();
        let req = backend.stream_request(&turn(&[], &options)).expect("request");
        assert_eq!(req.url, "https://api.perplexity.ai/chat/completions");
        assert_eq!(req.header_value("authorization"), Some("Bearer pplx-key"));
        assert!(backend.models_request().expect("models").is_none());
        assert_eq!(backend.fallback_models().len(), 6);
        assert_eq!(backend.default_model(), "sonar");
        assert!(backend.default_system_prompt().is_some());
        assert!(!backend.supports_native_tools());
    }

    #[test]
    fn lmstudio_needs_no_key() {
        let backend =
            OpenAiCompatible::new(Flavor::LmStudio, "").with_base_url("http://studio:1234/v1/");
        let options = ChatOptions::default();
        let req = backend.stream_request(&turn(&[], &options)).expect("keyless");
        assert_eq!(req.url, "http://studio:1234/v1/chat/completions");
        assert_eq!(req.header_value("authorization"), None);
        let models = backend.models_request().expect("models").expect("listing endpoint");
        assert_eq!(models.url, "http://studio:1234/v1/models");
        assert!(backend.fallback_models().is_empty());
        assert!(!backend.supports_native_tools());
    }

    #[test]
    fn error_event_becomes_error_delta() {
        assert_eq!(
            extract_delta(&json!({"error": {"message": "rate limited"}})),
            Delta::Error("stream error: rate limited".to_string())
        );
        assert_eq!(extract_delta(&json!({"choices": [{"delta": {}}]})), Delta::Skip);
    }
}
