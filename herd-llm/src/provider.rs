//! The uniform client surface and its one implementation over a [`Backend`].
//!
//! Every error is turned into data here: chat failures become a terminal
//! error chunk, tool failures set `ToolResponse::error`, and model listing
//! falls back to the backend's static table.

use crate::backend::{Backend, ChatOptions, ChatTurn};
use crate::catalog::{self, ModelQuery};
use crate::conversation::Conversation;
use crate::error::Result;
use crate::image;
use crate::stream::normalize;
use crate::tools::{embed_tools_in_prompt, sanitize_tools, validate_tool_name};
use crate::transport::Transport;
use crate::types::{
    Capability, Content, ContentPart, ImageGeneration, ImageGenerationRequest, ImageInput,
    Message, ModelDescriptor, StreamChunk, ToolDefinition, ToolResponse,
};
use async_trait::async_trait;
use futures_util::Stream;
use futures_util::StreamExt;
use std::pin::Pin;
use std::sync::Arc;

/// Lazy, non-restartable response stream. Holds the client's conversation
/// mutably until it is finished or dropped.
pub type ChatStream<'a> = Pin<Box<dyn Stream<Item = StreamChunk> + Send + 'a>>;

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub prompt: String,
    /// Empty selects the backend's default model.
    pub model: String,
    pub max_tokens: Option<u32>,
    pub image: Option<ImageInput>,
    pub options: ChatOptions,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn image(mut self, image: ImageInput) -> Self {
        self.image = Some(image);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = Some(temperature);
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.options.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolRequest {
    pub prompt: String,
    pub model: String,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> &'static str;

    fn conversation(&self) -> &Conversation;

    /// Never fails; falls back to the static model table.
    async fn list_models(&self, query: &ModelQuery) -> Vec<ModelDescriptor>;

    fn stream_chat_response(&mut self, request: ChatRequest) -> ChatStream<'_>;

    fn clear_conversation(&mut self);

    async fn call_tool(&mut self, request: ToolRequest) -> ToolResponse;

    async fn generate_image(&self, request: ImageGenerationRequest) -> Result<ImageGeneration>;

    fn process_image(&self, input: &ImageInput) -> Result<ContentPart> {
        image::process_image(input)
    }
}

pub struct ChatClient {
    backend: Arc<dyn Backend>,
    transport: Arc<dyn Transport>,
    conversation: Conversation,
}

impl ChatClient {
    pub fn new(
        backend: Arc<dyn Backend>,
        transport: Arc<dyn Transport>,
        system_prompt: Option<String>,
    ) -> Self {
        let system = system_prompt.or_else(|| backend.default_system_prompt().map(str::to_string));
        Self {
            backend,
            transport,
            conversation: Conversation::new(system),
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    fn resolve_model(&self, model: &str) -> String {
        resolve_model(self.backend.as_ref(), model)
    }

    async fn fetch_models(&self) -> Result<Vec<ModelDescriptor>> {
        let Some(request) = self.backend.models_request()? else {
            return Ok(Vec::new());
        };
        let body = self.transport.send(request).await?;
        self.backend.parse_models(&body)
    }

    async fn send_tool_request(
        &self,
        turn: &ChatTurn<'_>,
        tools: &[ToolDefinition],
    ) -> Result<ToolResponse> {
        let request = self.backend.tool_request(turn, tools)?;
        let body = self.transport.send(request).await?;
        self.backend.parse_tool_response(&body)
    }

    async fn call_native_tool(&mut self, request: ToolRequest) -> ToolResponse {
        let model = self.resolve_model(&request.model);
        let max_tokens = clamp_max_tokens(self.backend.as_ref(), request.max_tokens);
        let user = Message::user(request.prompt.as_str());
        let system = self.conversation.system_prompt().map(str::to_string);
        let history = self.history_with(user.clone());

        let (tools, names) = sanitize_tools(&request.tools);
        let options = ChatOptions::default();
        let turn = ChatTurn {
            model: &model,
            system: system.as_deref(),
            history: &history,
            max_tokens,
            options: &options,
        };

        match self.send_tool_request(&turn, &tools).await {
            Ok(mut response) => {
                names.restore(&mut response.tool_calls);
                self.conversation
                    .record_exchange(user, Message::assistant(response.content.clone()));
                response
            }
            Err(e) => {
                tracing::warn!(
                    provider = self.backend.name(),
                    %model,
                    error = %e,
                    "tool call failed"
                );
                ToolResponse::failed(e.to_string())
            }
        }
    }

    /// Conversation history followed by `user`, without touching the
    /// conversation itself.
    fn history_with(&self, user: Message) -> Vec<Message> {
        let mut history = self.conversation.history().to_vec();
        history.push(user);
        history
    }

    /// Tool definitions go into the prompt text sent to the vendor; the
    /// conversation records only the caller's prompt.
    async fn call_embedded_tool(&mut self, request: ToolRequest) -> ToolResponse {
        let model = self.resolve_model(&request.model);
        let max_tokens = clamp_max_tokens(self.backend.as_ref(), request.max_tokens);
        let system = self.conversation.system_prompt().map(str::to_string);
        let embedded = embed_tools_in_prompt(&request.prompt, &request.tools);
        let history = self.history_with(Message::user(embedded));
        let options = ChatOptions::default();
        let turn = ChatTurn {
            model: &model,
            system: system.as_deref(),
            history: &history,
            max_tokens,
            options: &options,
        };

        let raw = match self.backend.open_chat(self.transport.as_ref(), &turn).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    provider = self.backend.name(),
                    %model,
                    error = %e,
                    "tool call failed"
                );
                return ToolResponse::failed(e.to_string());
            }
        };
        let mut content = String::new();
        let mut chunks = normalize(raw);
        while let Some(chunk) = chunks.next().await {
            match chunk {
                StreamChunk::Content { content: delta } => content.push_str(&delta),
                StreamChunk::Error { error } => return ToolResponse::failed(error),
            }
        }

        self.conversation.record_exchange(
            Message::user(request.prompt.as_str()),
            Message::assistant(content.clone()),
        );
        ToolResponse {
            content,
            tool_calls: Vec::new(),
            error: None,
        }
    }
}

fn resolve_model(backend: &dyn Backend, model: &str) -> String {
    let model = model.trim();
    if model.is_empty() {
        backend.default_model().to_string()
    } else {
        model.to_string()
    }
}

/// Requested output tokens, defaulted and clamped to the backend ceiling.
pub fn clamp_max_tokens(backend: &dyn Backend, requested: Option<u32>) -> u32 {
    let requested = requested.unwrap_or_else(|| backend.default_max_tokens());
    match backend.max_tokens_ceiling() {
        Some(ceiling) if requested > ceiling => {
            tracing::warn!(
                provider = backend.name(),
                requested,
                ceiling,
                "max_tokens above provider ceiling; clamping"
            );
            ceiling
        }
        _ => requested,
    }
}

fn user_message(
    backend: &dyn Backend,
    model: &str,
    prompt: &str,
    image: Option<&ImageInput>,
) -> Result<Message> {
    let Some(input) = image else {
        return Ok(Message::user(prompt));
    };
    let part = image::process_image(input)?;
    if !backend.known_capability(model, Capability::Vision) {
        tracing::warn!(
            provider = backend.name(),
            %model,
            "model is not known to support vision; sending image anyway"
        );
    }
    Ok(Message::user(Content::Parts(vec![
        ContentPart::text(prompt),
        part,
    ])))
}

#[async_trait]
impl ProviderClient for ChatClient {
    fn provider(&self) -> &'static str {
        self.backend.name()
    }

    fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    #[tracing::instrument(level = "debug", skip_all, fields(provider = self.backend.name()))]
    async fn list_models(&self, query: &ModelQuery) -> Vec<ModelDescriptor> {
        let models = match self.fetch_models().await {
            Ok(models) if !models.is_empty() => models,
            Ok(_) => {
                tracing::debug!("no live model listing; using static table");
                self.backend.fallback_models()
            }
            Err(e) => {
                tracing::warn!(error = %e, "model listing failed; using static table");
                self.backend.fallback_models()
            }
        };
        catalog::select(models, query)
    }

    fn stream_chat_response(&mut self, request: ChatRequest) -> ChatStream<'_> {
        let backend = Arc::clone(&self.backend);
        let transport = Arc::clone(&self.transport);
        let conversation = &mut self.conversation;

        Box::pin(async_stream::stream! {
            let model = resolve_model(backend.as_ref(), &request.model);
            let image = request.image.as_ref();
            let user = match user_message(backend.as_ref(), &model, &request.prompt, image) {
                Ok(user) => user,
                Err(e) => {
                    yield StreamChunk::error(e.to_string());
                    return;
                }
            };
            let max_tokens = clamp_max_tokens(backend.as_ref(), request.max_tokens);
            let system = request
                .options
                .system_prompt
                .clone()
                .filter(|s| !s.trim().is_empty())
                .or_else(|| conversation.system_prompt().map(str::to_string));

            tracing::info!(provider = backend.name(), %model, max_tokens, "chat request");
            let mut pending = conversation.begin_turn(user);
            let opened = {
                let turn = ChatTurn {
                    model: &model,
                    system: system.as_deref(),
                    history: pending.conversation().history(),
                    max_tokens,
                    options: &request.options,
                };
                backend.open_chat(transport.as_ref(), &turn).await
            };
            let raw = match opened {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(
                        provider = backend.name(),
                        %model,
                        error = %e,
                        "chat request failed"
                    );
                    pending.rollback();
                    yield StreamChunk::error(e.to_string());
                    return;
                }
            };

            let mut chunks = normalize(raw);
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    StreamChunk::Content { content } => {
                        pending.push_delta(&content);
                        yield StreamChunk::Content { content };
                    }
                    StreamChunk::Error { error } => {
                        tracing::warn!(
                            provider = backend.name(),
                            %model,
                            %error,
                            "chat stream failed"
                        );
                        pending.rollback();
                        yield StreamChunk::Error { error };
                        return;
                    }
                }
            }
            tracing::debug!(
                provider = backend.name(),
                chars = pending.reply().len(),
                "chat response complete"
            );
            pending.commit();
        })
    }

    fn clear_conversation(&mut self) {
        self.conversation.clear();
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(provider = self.backend.name(), tools = request.tools.len())
    )]
    async fn call_tool(&mut self, request: ToolRequest) -> ToolResponse {
        if let Some(e) = request
            .tools
            .iter()
            .find_map(|t| validate_tool_name(&t.name).err())
        {
            return ToolResponse::failed(e.to_string());
        }
        if self.backend.supports_native_tools() {
            self.call_native_tool(request).await
        } else {
            self.call_embedded_tool(request).await
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(provider = self.backend.name()))]
    async fn generate_image(&self, request: ImageGenerationRequest) -> Result<ImageGeneration> {
        let http = self.backend.image_request(&request)?;
        let body = self.transport.send(http).await?;
        self.backend.parse_image_response(&body, &request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{AnthropicBackend, Flavor, OllamaBackend, OpenAiCompatible};
    use crate::error::LlmError;
    use crate::transport::testing::StubTransport;
    use crate::types::Role;
    use bytes::Bytes;
    use serde_json::json;

    const HELLO_SSE: &str = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: [DONE]\n\n",
    );

    fn openai_client(stub: &Arc<StubTransport>, system: Option<&str>) -> ChatClient {
        ChatClient::new(
            Arc::new(OpenAiCompatible::new(Flavor::OpenAi, "sk-test")),
            stub.clone(),
            system.map(str::to_string),
        )
    }

    async fn collect(client: &mut ChatClient, request: ChatRequest) -> Vec<StreamChunk> {
        client.stream_chat_response(request).collect().await
    }

    #[tokio::test]
    async fn successful_stream_appends_user_and_assistant() {
        let stub = Arc::new(StubTransport::new());
        stub.push_body(HELLO_SSE);
        let mut client = openai_client(&stub, None);

        let chunks = collect(&mut client, ChatRequest::new("Hi").model("gpt-4o")).await;
        assert_eq!(chunks, vec![StreamChunk::content("Hel"), StreamChunk::content("lo")]);
        assert_eq!(
            client.conversation().messages(),
            &[Message::user("Hi"), Message::assistant("Hello")]
        );

        let body = stub.requests()[0].body.clone().expect("body");
        assert_eq!(body["model"], json!("gpt-4o"));
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["messages"], json!([{"role": "user", "content": "Hi"}]));
    }

    #[tokio::test]
    async fn failed_open_rolls_back_and_next_turn_starts_clean() {
        let stub = Arc::new(StubTransport::new());
        stub.push_open_error(LlmError::Http("503 Service Unavailable".to_string()));
        stub.push_body(HELLO_SSE);
        let mut client = openai_client(&stub, Some("be brief"));

        let chunks = collect(&mut client, ChatRequest::new("first")).await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_error());
        assert_eq!(client.conversation().len(), 1);

        collect(&mut client, ChatRequest::new("second")).await;
        let roles: Vec<Role> = client.conversation().messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(client.conversation().messages()[1].text(), "second");

        // The retried request must not carry the failed user message.
        let body = stub.requests()[1].body.clone().expect("body");
        assert_eq!(body["messages"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn mid_stream_error_rolls_back() {
        let stub = Arc::new(StubTransport::new());
        stub.push_chunks(vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n")),
            Err(LlmError::Http("connection reset".to_string())),
        ]);
        let mut client = openai_client(&stub, None);

        let chunks = collect(&mut client, ChatRequest::new("Hi")).await;
        assert_eq!(chunks[0], StreamChunk::content("Hel"));
        assert_eq!(chunks.last(), Some(&StreamChunk::error("http error: connection reset")));
        assert!(client.conversation().is_empty());
    }

    #[tokio::test]
    async fn dropping_the_stream_early_rolls_back() {
        let stub = Arc::new(StubTransport::new());
        stub.push_hanging_body("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n");
        let mut client = openai_client(&stub, Some("sys"));

        {
            let mut stream = client.stream_chat_response(ChatRequest::new("Hi"));
            assert_eq!(stream.next().await, Some(StreamChunk::content("Hel")));
        }
        assert_eq!(client.conversation().len(), 1);
        assert_eq!(client.conversation().messages()[0].role, Role::System);
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let stub = Arc::new(StubTransport::new());
        stub.push_body(HELLO_SSE);
        let mut client = openai_client(&stub, Some("sys"));
        collect(&mut client, ChatRequest::new("Hi")).await;
        assert_eq!(client.conversation().len(), 3);

        client.clear_conversation();
        let once = client.conversation().messages().to_vec();
        client.clear_conversation();
        assert_eq!(client.conversation().messages(), once.as_slice());
        assert_eq!(once, vec![Message::system("sys")]);
    }

    #[tokio::test]
    async fn anthropic_max_tokens_is_clamped() {
        let stub = Arc::new(StubTransport::new());
        stub.push_body(concat!(
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"ok\"}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        ));
        let mut client = ChatClient::new(Arc::new(AnthropicBackend::new("ak")), stub.clone(), None);

        let chunks = collect(&mut client, ChatRequest::new("Hi").max_tokens(Some(100_000))).await;
        assert_eq!(chunks, vec![StreamChunk::content("ok")]);
        let body = stub.requests()[0].body.clone().expect("body");
        assert_eq!(body["max_tokens"], json!(4096));
    }

    #[tokio::test]
    async fn request_system_prompt_overrides_conversation_for_one_turn() {
        let stub = Arc::new(StubTransport::new());
        stub.push_body(HELLO_SSE);
        let mut client = openai_client(&stub, Some("default"));
        collect(&mut client, ChatRequest::new("Hi").system_prompt("pirate")).await;

        let body = stub.requests()[0].body.clone().expect("body");
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "pirate"}));
        assert_eq!(client.conversation().messages()[0], Message::system("default"));
    }

    #[tokio::test]
    async fn missing_key_is_an_error_chunk() {
        let stub = Arc::new(StubTransport::new());
        let mut client = ChatClient::new(
            Arc::new(OpenAiCompatible::new(Flavor::OpenAi, "")),
            stub.clone(),
            None,
        );
        let chunks = collect(&mut client, ChatRequest::new("Hi")).await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], StreamChunk::Error { error } if error.contains("api key")));
        assert!(client.conversation().is_empty());
        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn unreadable_image_fails_before_touching_history() {
        let stub = Arc::new(StubTransport::new());
        let mut client = openai_client(&stub, None);
        let request = ChatRequest::new("what is this?")
            .image(ImageInput::Path("/definitely/not/here.png".into()));
        let chunks = collect(&mut client, request).await;
        assert!(chunks[0].is_error());
        assert!(client.conversation().is_empty());
    }

    #[tokio::test]
    async fn listing_falls_back_to_static_table() {
        let stub = Arc::new(StubTransport::new());
        let client = openai_client(&stub, None);
        let models = client
            .list_models(&ModelQuery::default().page(1, 2))
            .await;
        assert_eq!(models.len(), 2);
        assert!(models.iter().all(|m| m.provider == "openai"));

        stub.push_json(Ok(json!({"data": [
            {"id": "gpt-4o", "created": 1715367049},
            {"id": "gpt-4o-mini", "created": 1721172741}
        ]})));
        let live = client.list_models(&ModelQuery::default()).await;
        let ids: Vec<&str> = live.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["gpt-4o-mini", "gpt-4o"]);
    }

    #[tokio::test]
    async fn native_tool_call_restores_names_and_records_exchange() {
        let stub = Arc::new(StubTransport::new());
        stub.push_json(Ok(json!({"choices": [{"message": {
            "content": null,
            "tool_calls": [{"id": "call_1", "type": "function",
                "function": {"name": "shell_execute", "arguments": "{\"cmd\":\"ls\"}"}}]
        }}]})));
        let mut client = openai_client(&stub, None);

        let response = client
            .call_tool(ToolRequest {
                prompt: "list files".to_string(),
                model: "gpt-4o".to_string(),
                tools: vec![ToolDefinition {
                    name: "shell.execute".to_string(),
                    description: "run a command".to_string(),
                    parameters: json!({"type": "object"}),
                }],
                max_tokens: None,
            })
            .await;
        assert!(response.error.is_none());
        assert_eq!(response.tool_calls[0].function_name, "shell.execute");
        assert_eq!(response.tool_calls[0].arguments_json, r#"{"cmd":"ls"}"#);
        assert_eq!(client.conversation().len(), 2);

        let body = stub.requests()[0].body.clone().expect("body");
        assert_eq!(body["tools"][0]["function"]["name"], json!("shell_execute"));
        assert_eq!(body["stream"], json!(false));
    }

    #[tokio::test]
    async fn failed_tool_call_leaves_conversation_untouched() {
        let stub = Arc::new(StubTransport::new());
        stub.push_json(Err(LlmError::Http("500".to_string())));
        let mut client = openai_client(&stub, Some("sys"));

        let response = client
            .call_tool(ToolRequest {
                prompt: "list files".to_string(),
                ..ToolRequest::default()
            })
            .await;
        assert!(response.error.is_some());
        assert!(response.tool_calls.is_empty());
        assert_eq!(client.conversation().len(), 1);
    }

    #[tokio::test]
    async fn tools_are_embedded_for_backends_without_native_support() {
        let stub = Arc::new(StubTransport::new());
        stub.push_body(concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"{\\\"tool\\\": \\\"clock\\\"}\"},\"done\":false}\n",
            "{\"done\":true}\n",
        ));
        let mut client = ChatClient::new(Arc::new(OllamaBackend::default()), stub.clone(), None);

        let response = client
            .call_tool(ToolRequest {
                prompt: "what time is it?".to_string(),
                tools: vec![ToolDefinition {
                    name: "clock".to_string(),
                    description: "current time".to_string(),
                    parameters: json!({}),
                }],
                ..ToolRequest::default()
            })
            .await;
        assert!(response.error.is_none());
        assert!(response.tool_calls.is_empty());
        assert_eq!(response.content, r#"{"tool": "clock"}"#);

        let body = stub.requests()[0].body.clone().expect("body");
        let sent = body["messages"][0]["content"].as_str().unwrap_or_default();
        assert!(sent.contains("- clock: current time"), "{sent}");
        assert!(sent.ends_with("Request: what time is it?"), "{sent}");

        let recorded = client.conversation().history();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].role, Role::User);
        assert_eq!(recorded[0].content, Content::Text("what time is it?".to_string()));
        assert_eq!(recorded[1].content, Content::Text(r#"{"tool": "clock"}"#.to_string()));
    }

    #[tokio::test]
    async fn image_generation_is_unsupported_on_anthropic() {
        let stub = Arc::new(StubTransport::new());
        let client = ChatClient::new(Arc::new(AnthropicBackend::new("ak")), stub.clone(), None);
        let err = client
            .generate_image(ImageGenerationRequest::new("a cat"))
            .await
            .err()
            .expect("unsupported");
        assert!(matches!(err, LlmError::Unsupported(_)));
        assert!(stub.requests().is_empty());
    }
}
