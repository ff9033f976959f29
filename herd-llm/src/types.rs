use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        value: String,
    },
    /// Base64 payload without any `data:` prefix.
    Image {
        data: String,
        media_type: String,
    },
}

impl ContentPart {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text {
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Parts(parts) => {
                let mut out = String::new();
                for p in parts {
                    if let ContentPart::Text { value } = p {
                        if !out.is_empty() {
                            out.push('\n');
                        }
                        out.push_str(value);
                    }
                }
                out
            }
        }
    }

    pub fn images(&self) -> Vec<(&str, &str)> {
        match self {
            Content::Text(_) => Vec::new(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Image { data, media_type } => {
                        Some((data.as_str(), media_type.as_str()))
                    }
                    ContentPart::Text { .. } => None,
                })
                .collect(),
        }
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Content::Text(content.into()),
        }
    }

    pub fn user(content: impl Into<Content>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(content.into()),
        }
    }

    pub fn text(&self) -> String {
        self.content.text()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function_name: String,
    /// JSON string.
    pub arguments_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema.
    #[serde(default = "empty_object_schema")]
    pub parameters: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResponse {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            tool_calls: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Uniform unit yielded by `stream_chat_response`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamChunk {
    Content { content: String },
    Error { error: String },
}

impl StreamChunk {
    pub fn content(content: impl Into<String>) -> Self {
        Self::Content {
            content: content.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    pub fn as_content(&self) -> Option<&str> {
        match self {
            Self::Content { content } => Some(content),
            Self::Error { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Text,
    Vision,
    Function,
    Audio,
    ImageGeneration,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Text => "text",
            Capability::Vision => "vision",
            Capability::Function => "function",
            Capability::Audio => "audio",
            Capability::ImageGeneration => "image-generation",
        }
    }
}

impl FromStr for Capability {
    type Err = crate::error::LlmError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "chat" => Ok(Self::Text),
            "vision" | "image" => Ok(Self::Vision),
            "function" | "functions" | "tools" | "function_calling" => Ok(Self::Function),
            "audio" => Ok(Self::Audio),
            "image-generation" | "image_generation" => Ok(Self::ImageGeneration),
            other => Err(crate::error::LlmError::InvalidInput(format!(
                "unknown capability: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub capabilities: BTreeSet<Capability>,
    pub context_length: u32,
    pub created_at: DateTime<Utc>,
    pub provider: String,
}

impl ModelDescriptor {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageInput {
    Path(PathBuf),
    /// Raw base64 or a `data:<media>;base64,<payload>` URL.
    Data(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_image_count")]
    pub n: u32,
    #[serde(default = "default_image_size")]
    pub size: String,
    #[serde(default = "default_image_response_format")]
    pub response_format: String,
}

fn default_image_count() -> u32 {
    1
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

fn default_image_response_format() -> String {
    "url".to_string()
}

impl ImageGenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            n: default_image_count(),
            size: default_image_size(),
            response_format: default_image_response_format(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratedImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGeneration {
    pub created: DateTime<Utc>,
    pub model: String,
    pub images: Vec<GeneratedImage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_chunk_serializes_to_flat_objects() {
        let c = serde_json::to_value(StreamChunk::content("hi")).expect("serialize content");
        assert_eq!(c, json!({ "content": "hi" }));
        let e = serde_json::to_value(StreamChunk::error("boom")).expect("serialize error");
        assert_eq!(e, json!({ "error": "boom" }));
    }

    #[test]
    fn content_text_joins_text_parts_and_skips_images() {
        let content = Content::Parts(vec![
            ContentPart::text("describe"),
            ContentPart::Image {
                data: "AAAA".to_string(),
                media_type: "image/png".to_string(),
            },
            ContentPart::text("briefly"),
        ]);
        assert_eq!(content.text(), "describe\nbriefly");
        assert_eq!(content.images(), vec![("AAAA", "image/png")]);
    }

    #[test]
    fn capability_parses_vendor_aliases() {
        assert_eq!("chat".parse::<Capability>().expect("chat"), Capability::Text);
        assert_eq!(
            "function_calling".parse::<Capability>().expect("fc"),
            Capability::Function
        );
        assert_eq!(
            serde_json::to_value(Capability::ImageGeneration).expect("serialize"),
            json!("image-generation")
        );
        assert!("telepathy".parse::<Capability>().is_err());
    }
}
