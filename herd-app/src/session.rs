//! Per-session provider clients.
//!
//! Each session id owns one client and therefore one conversation. The
//! per-session mutex serializes requests that share an id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use herd_llm::{ProviderClient, ProviderKind};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type BoxedClient = Box<dyn ProviderClient>;

pub type SharedClient = Arc<Mutex<BoxedClient>>;

pub type MakeClient<'a> = &'a (dyn Fn() -> anyhow::Result<BoxedClient> + Send + Sync);

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub provider: ProviderKind,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    /// `None` while a request holds the session.
    pub messages: Option<usize>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    fn get(&self, id: &str) -> Option<SharedClient>;

    /// Insert `client` under `id`, replacing any existing session.
    fn create(&self, id: &str, provider: ProviderKind, client: BoxedClient) -> SharedClient;

    /// Existing session for `id`, or a new one from `factory`. A session
    /// bound to a different provider is replaced.
    fn get_or_create(
        &self,
        id: &str,
        provider: ProviderKind,
        factory: MakeClient<'_>,
    ) -> anyhow::Result<SharedClient>;

    /// Reset the session's conversation. `false` if there is no such session.
    async fn clear(&self, id: &str) -> bool;

    fn remove(&self, id: &str) -> bool;

    fn list(&self) -> Vec<SessionInfo>;

    fn len(&self) -> usize;
}

struct SessionEntry {
    client: SharedClient,
    provider: ProviderKind,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
}

impl SessionEntry {
    fn new(provider: ProviderKind, client: BoxedClient) -> Self {
        let now = Utc::now();
        Self {
            client: Arc::new(Mutex::new(client)),
            provider,
            created_at: now,
            last_active: now,
        }
    }

    fn info(&self, id: &str) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            provider: self.provider,
            created_at: self.created_at,
            last_active: self.last_active,
            messages: self
                .client
                .try_lock()
                .ok()
                .map(|client| client.conversation().len()),
        }
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, SessionEntry>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn get(&self, id: &str) -> Option<SharedClient> {
        let mut entry = self.sessions.get_mut(id)?;
        entry.last_active = Utc::now();
        Some(entry.client.clone())
    }

    fn create(&self, id: &str, provider: ProviderKind, client: BoxedClient) -> SharedClient {
        let entry = SessionEntry::new(provider, client);
        let shared = entry.client.clone();
        if self.sessions.insert(id.to_string(), entry).is_some() {
            tracing::debug!(session_id = %id, "replaced existing session");
        }
        shared
    }

    fn get_or_create(
        &self,
        id: &str,
        provider: ProviderKind,
        factory: MakeClient<'_>,
    ) -> anyhow::Result<SharedClient> {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().provider == provider => {
                let entry = occupied.get_mut();
                entry.last_active = Utc::now();
                Ok(entry.client.clone())
            }
            Entry::Occupied(mut occupied) => {
                tracing::info!(
                    session_id = %id,
                    from = %occupied.get().provider,
                    to = %provider,
                    "session switched provider; starting a new conversation"
                );
                let entry = SessionEntry::new(provider, factory()?);
                let shared = entry.client.clone();
                occupied.insert(entry);
                Ok(shared)
            }
            Entry::Vacant(vacant) => {
                tracing::debug!(session_id = %id, %provider, "session created");
                let entry = SessionEntry::new(provider, factory()?);
                let shared = entry.client.clone();
                vacant.insert(entry);
                Ok(shared)
            }
        }
    }

    async fn clear(&self, id: &str) -> bool {
        let Some(client) = self.get(id) else {
            return false;
        };
        client.lock().await.clear_conversation();
        true
    }

    fn remove(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    fn list(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.value().info(entry.key()))
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use herd_llm::{
        ChatRequest, ChatStream, Conversation, ImageGeneration, ImageGenerationRequest, LlmError,
        Message, ModelDescriptor, ModelQuery, ProviderClient, StreamChunk, ToolRequest,
        ToolResponse,
    };

    /// Replies with the prompt split into two chunks. The prompt `"model"`
    /// is answered with the requested model id instead.
    pub struct EchoClient {
        conversation: Conversation,
    }

    impl EchoClient {
        pub fn boxed() -> Box<dyn ProviderClient> {
            Box::new(Self {
                conversation: Conversation::new(None),
            })
        }
    }

    #[async_trait]
    impl ProviderClient for EchoClient {
        fn provider(&self) -> &'static str {
            "echo"
        }

        fn conversation(&self) -> &Conversation {
            &self.conversation
        }

        async fn list_models(&self, _query: &ModelQuery) -> Vec<ModelDescriptor> {
            Vec::new()
        }

        fn stream_chat_response(&mut self, request: ChatRequest) -> ChatStream<'_> {
            if request.prompt == "fail" {
                return Box::pin(futures_util::stream::iter(vec![StreamChunk::error(
                    "http error: 503",
                )]));
            }
            if request.prompt == "model" {
                return Box::pin(futures_util::stream::iter(vec![StreamChunk::content(
                    request.model,
                )]));
            }
            self.conversation.record_exchange(
                Message::user(request.prompt.as_str()),
                Message::assistant(request.prompt.clone()),
            );
            let mid = request.prompt.len() / 2;
            let (a, b) = request.prompt.split_at(mid);
            Box::pin(futures_util::stream::iter(vec![
                StreamChunk::content(a),
                StreamChunk::content(b),
            ]))
        }

        fn clear_conversation(&mut self) {
            self.conversation.clear();
        }

        async fn call_tool(&mut self, request: ToolRequest) -> ToolResponse {
            ToolResponse {
                content: format!("{} tools offered", request.tools.len()),
                ..ToolResponse::default()
            }
        }

        async fn generate_image(
            &self,
            _request: ImageGenerationRequest,
        ) -> herd_llm::Result<ImageGeneration> {
            Err(LlmError::Unsupported("echo does not generate images".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::EchoClient;
    use super::*;
    use futures_util::StreamExt;
    use herd_llm::ChatRequest;

    fn echo_factory() -> anyhow::Result<BoxedClient> {
        Ok(EchoClient::boxed())
    }

    #[tokio::test]
    async fn get_or_create_reuses_the_same_client() {
        let store = InMemorySessionStore::new();
        let a = store
            .get_or_create("s1", ProviderKind::Ollama, &echo_factory)
            .expect("create");
        let b = store
            .get_or_create("s1", ProviderKind::Ollama, &echo_factory)
            .expect("reuse");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
        assert!(store.get("s1").is_some());
        assert!(store.get("s2").is_none());
    }

    #[tokio::test]
    async fn switching_provider_replaces_the_session() {
        let store = InMemorySessionStore::new();
        let a = store
            .get_or_create("s1", ProviderKind::Ollama, &echo_factory)
            .expect("create");
        let b = store
            .get_or_create("s1", ProviderKind::Mlx, &echo_factory)
            .expect("replace");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(store.list()[0].provider, ProviderKind::Mlx);
    }

    #[tokio::test]
    async fn factory_errors_propagate_and_store_nothing() {
        let store = InMemorySessionStore::new();
        let failing = || -> anyhow::Result<BoxedClient> { Err(anyhow::anyhow!("no key")) };
        assert!(store.get_or_create("s1", ProviderKind::OpenAi, &failing).is_err());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn clear_resets_conversation_and_remove_drops_session() {
        let store = InMemorySessionStore::new();
        let client = store.create("s1", ProviderKind::Ollama, EchoClient::boxed());
        {
            let mut guard = client.lock().await;
            let chunks: Vec<_> = guard
                .stream_chat_response(ChatRequest::new("hello"))
                .collect()
                .await;
            assert_eq!(chunks.len(), 2);
        }
        assert_eq!(store.list()[0].messages, Some(2));

        assert!(store.clear("s1").await);
        assert_eq!(client.lock().await.conversation().len(), 0);
        assert!(!store.clear("missing").await);

        assert!(store.remove("s1"));
        assert!(!store.remove("s1"));
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn busy_sessions_report_no_message_count() {
        let store = InMemorySessionStore::new();
        let client = store.create("s1", ProviderKind::Ollama, EchoClient::boxed());
        let _held = client.lock().await;
        assert_eq!(store.list()[0].messages, None);
    }
}
