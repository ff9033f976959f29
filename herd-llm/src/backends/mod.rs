//! Vendor backends.

pub mod anthropic;
pub mod cohere;
pub mod gemini;
pub mod mlx;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicBackend;
pub use cohere::CohereBackend;
pub use gemini::GeminiBackend;
pub use mlx::MlxBackend;
pub use ollama::OllamaBackend;
pub use openai::{Flavor, OpenAiCompatible};

fn str_at<'a>(value: &'a serde_json::Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(serde_json::Value::as_str)
}
