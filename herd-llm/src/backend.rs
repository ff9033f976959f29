//! Per-vendor strategy behind the generic chat client.

use crate::error::{LlmError, Result};
use crate::stream::{DeltaExtractor, RawStream, WireFormat};
use crate::transport::{HttpRequest, Transport};
use crate::types::{
    Capability, ImageGeneration, ImageGenerationRequest, Message, ModelDescriptor, ToolDefinition,
    ToolResponse,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    /// Replaces the conversation's system prompt for this request only.
    pub system_prompt: Option<String>,
    /// Merged into the top level of the vendor request body.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Everything a backend needs to render one outbound chat request.
#[derive(Debug, Clone, Copy)]
pub struct ChatTurn<'a> {
    pub model: &'a str,
    pub system: Option<&'a str>,
    /// Conversation without the system message, ending with the new user message.
    pub history: &'a [Message],
    pub max_tokens: u32,
    pub options: &'a ChatOptions,
}

impl ChatTurn<'_> {
    pub fn apply_extra(&self, body: &mut serde_json::Value) {
        if let Some(obj) = body.as_object_mut() {
            for (k, v) in &self.options.extra {
                obj.insert(k.clone(), v.clone());
            }
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn default_model(&self) -> &str;

    fn wire_format(&self) -> WireFormat;

    fn delta_extractor(&self) -> DeltaExtractor;

    /// Hard output-token ceiling; requests above it are clamped.
    fn max_tokens_ceiling(&self) -> Option<u32> {
        None
    }

    fn default_max_tokens(&self) -> u32 {
        1024
    }

    fn default_system_prompt(&self) -> Option<&str> {
        None
    }

    fn fallback_models(&self) -> Vec<ModelDescriptor>;

    /// `None` when the vendor has no listing endpoint.
    fn models_request(&self) -> Result<Option<HttpRequest>>;

    fn parse_models(&self, body: &serde_json::Value) -> Result<Vec<ModelDescriptor>>;

    fn stream_request(&self, turn: &ChatTurn<'_>) -> Result<HttpRequest>;

    async fn open_chat(&self, transport: &dyn Transport, turn: &ChatTurn<'_>) -> Result<RawStream> {
        let request = self.stream_request(turn)?;
        let bytes = transport.open_stream(request).await?;
        match self.wire_format() {
            WireFormat::Sse => Ok(RawStream::Sse(bytes, self.delta_extractor())),
            WireFormat::Ndjson => Ok(RawStream::Ndjson(bytes, self.delta_extractor())),
            WireFormat::Fragments => Err(LlmError::Unsupported(format!(
                "{} produces fragments and must open its own stream",
                self.name()
            ))),
        }
    }

    fn supports_native_tools(&self) -> bool {
        false
    }

    /// Non-streaming request carrying already-sanitized tool definitions.
    fn tool_request(&self, _turn: &ChatTurn<'_>, _tools: &[ToolDefinition]) -> Result<HttpRequest> {
        Err(LlmError::Unsupported(format!(
            "{} has no native tool calling",
            self.name()
        )))
    }

    fn parse_tool_response(&self, _body: &serde_json::Value) -> Result<ToolResponse> {
        Err(LlmError::Unsupported(format!(
            "{} has no native tool calling",
            self.name()
        )))
    }

    fn image_request(&self, _request: &ImageGenerationRequest) -> Result<HttpRequest> {
        Err(LlmError::Unsupported(format!(
            "{} does not generate images",
            self.name()
        )))
    }

    fn parse_image_response(
        &self,
        _body: &serde_json::Value,
        _request: &ImageGenerationRequest,
    ) -> Result<ImageGeneration> {
        Err(LlmError::Unsupported(format!(
            "{} does not generate images",
            self.name()
        )))
    }

    /// Whether the static table lists `model` with `capability`.
    fn known_capability(&self, model: &str, capability: Capability) -> bool {
        self.fallback_models()
            .iter()
            .any(|m| m.id == model && m.supports(capability))
    }
}

pub(crate) fn require_key<'a>(provider: &str, key: &'a str) -> Result<&'a str> {
    if key.trim().is_empty() {
        return Err(LlmError::Config(format!("{provider} api key is not configured")));
    }
    Ok(key)
}
