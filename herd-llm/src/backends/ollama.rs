use super::str_at;
use crate::backend::{Backend, ChatTurn};
use crate::catalog::from_rfc3339;
use crate::error::Result;
use crate::stream::{Delta, DeltaExtractor, WireFormat};
use crate::transport::HttpRequest;
use crate::types::{Capability, Message, ModelDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

/// Local Ollama daemon. Streams NDJSON and lets the model pick its own
/// output length (`num_predict = -1`).
#[derive(Clone)]
pub struct OllamaBackend {
    host: String,
}

impl OllamaBackend {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new(DEFAULT_OLLAMA_HOST)
    }
}

pub fn extract_delta(event: &serde_json::Value) -> Delta {
    if let Some(error) = str_at(event, "/error") {
        return Delta::Error(format!("ollama error: {error}"));
    }
    let text = str_at(event, "/message/content").or_else(|| str_at(event, "/response"));
    match text {
        Some(text) if !text.is_empty() => Delta::Text(text.to_string()),
        _ if event.get("done").and_then(serde_json::Value::as_bool) == Some(true) => Delta::Done,
        _ => Delta::Skip,
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

fn to_ollama_message(m: &Message) -> OllamaMessage {
    OllamaMessage {
        role: m.role.as_str(),
        content: m.content.text(),
        images: m
            .content
            .images()
            .into_iter()
            .map(|(data, _)| data.to_string())
            .collect(),
    }
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaTag {
    name: String,
    #[serde(default)]
    modified_at: Option<String>,
    #[serde(default)]
    details: OllamaTagDetails,
}

#[derive(Debug, Default, Deserialize)]
struct OllamaTagDetails {
    #[serde(default)]
    families: Option<Vec<String>>,
    #[serde(default)]
    parameter_size: Option<String>,
}

impl Backend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn default_model(&self) -> &str {
        "llava"
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::Ndjson
    }

    fn delta_extractor(&self) -> DeltaExtractor {
        extract_delta
    }

    /// Whatever is installed locally; there is no meaningful static table.
    fn fallback_models(&self) -> Vec<ModelDescriptor> {
        Vec::new()
    }

    fn models_request(&self) -> Result<Option<HttpRequest>> {
        Ok(Some(HttpRequest::get(format!("{}/api/tags", self.host))))
    }

    fn parse_models(&self, body: &serde_json::Value) -> Result<Vec<ModelDescriptor>> {
        let tags: OllamaTags = serde_json::from_value(body.clone())?;
        Ok(tags
            .models
            .into_iter()
            .map(|m| {
                let mut capabilities = BTreeSet::from([Capability::Text]);
                let families = m.details.families.unwrap_or_default();
                if families.iter().any(|f| f == "clip" || f == "mllama") {
                    capabilities.insert(Capability::Vision);
                }
                let display_name = match &m.details.parameter_size {
                    Some(size) => format!("{} ({size})", m.name),
                    None => m.name.clone(),
                };
                ModelDescriptor {
                    id: m.name,
                    display_name,
                    capabilities,
                    context_length: 4096,
                    created_at: m
                        .modified_at
                        .as_deref()
                        .map(from_rfc3339)
                        .unwrap_or(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH),
                    provider: "ollama".to_string(),
                }
            })
            .collect())
    }

    fn stream_request(&self, turn: &ChatTurn<'_>) -> Result<HttpRequest> {
        let mut messages = Vec::with_capacity(turn.history.len() + 1);
        if let Some(system) = turn.system {
            messages.push(to_ollama_message(&Message::system(system)));
        }
        messages.extend(turn.history.iter().map(to_ollama_message));

        let req = OllamaChatRequest {
            model: turn.model,
            messages,
            stream: true,
            options: OllamaOptions {
                num_predict: -1,
                temperature: turn.options.temperature,
            },
        };
        let mut body = serde_json::to_value(req)?;
        turn.apply_extra(&mut body);
        Ok(HttpRequest::post(format!("{}/api/chat", self.host), body))
    }
}
