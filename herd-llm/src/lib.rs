//! Uniform streaming client over commercial and local LLM providers.
//!
//! A [`ChatClient`] pairs one vendor [`Backend`] with a [`Transport`] and owns
//! the conversation history for that pairing. Responses arrive as a stream of
//! [`StreamChunk`]s whatever the vendor's wire format.

pub mod backend;
pub mod backends;
pub mod catalog;
pub mod conversation;
mod error;
pub mod factory;
pub mod image;
pub mod provider;
pub mod stream;
pub mod tools;
pub mod transport;
mod types;

pub use backend::{Backend, ChatOptions};
pub use catalog::{ModelQuery, SortKey};
pub use conversation::Conversation;
pub use error::{LlmError, Result};
pub use factory::{ProviderKind, ProviderSettings, available_providers, build_client};
pub use provider::{ChatClient, ChatRequest, ChatStream, ProviderClient, ToolRequest};
pub use transport::{HttpTransport, Transport};
pub use types::{
    Capability, Content, ContentPart, GeneratedImage, ImageGeneration, ImageGenerationRequest,
    ImageInput, Message, ModelDescriptor, Role, StreamChunk, ToolCall, ToolDefinition,
    ToolResponse,
};
