//! Constructing clients by provider name.

use crate::backend::Backend;
use crate::backends::{
    AnthropicBackend, CohereBackend, Flavor, GeminiBackend, MlxBackend, OllamaBackend,
    OpenAiCompatible,
};
use crate::error::{LlmError, Result};
use crate::provider::ChatClient;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Mistral,
    Xai,
    Cohere,
    Gemini,
    Perplexity,
    Ollama,
    Mlx,
    LmStudio,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 10] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Mistral,
        ProviderKind::Xai,
        ProviderKind::Cohere,
        ProviderKind::Gemini,
        ProviderKind::Perplexity,
        ProviderKind::Ollama,
        ProviderKind::Mlx,
        ProviderKind::LmStudio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Mistral => "mistral",
            ProviderKind::Xai => "xai",
            ProviderKind::Cohere => "cohere",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Perplexity => "perplexity",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Mlx => "mlx",
            ProviderKind::LmStudio => "lmstudio",
        }
    }

    /// Environment variable conventionally holding this provider's key.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Mistral => Some("MISTRAL_API_KEY"),
            ProviderKind::Xai => Some("XAI_API_KEY"),
            ProviderKind::Cohere => Some("COHERE_API_KEY"),
            ProviderKind::Gemini => Some("GEMINI_API_KEY"),
            ProviderKind::Perplexity => Some("PERPLEXITY_API_KEY"),
            ProviderKind::Ollama | ProviderKind::Mlx | ProviderKind::LmStudio => None,
        }
    }

    pub fn requires_key(&self) -> bool {
        self.api_key_env().is_some()
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "gpt" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "mistral" => Ok(Self::Mistral),
            "xai" | "x.ai" | "grok" => Ok(Self::Xai),
            "cohere" => Ok(Self::Cohere),
            "gemini" | "google" => Ok(Self::Gemini),
            "perplexity" | "pplx" => Ok(Self::Perplexity),
            "ollama" => Ok(Self::Ollama),
            "mlx" => Ok(Self::Mlx),
            "lmstudio" | "lm-studio" | "lm_studio" => Ok(Self::LmStudio),
            other => Err(LlmError::InvalidInput(format!("unknown provider: {other}"))),
        }
    }
}

/// Credentials and endpoints shared by every client the factory builds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub mistral_api_key: Option<String>,
    pub xai_api_key: Option<String>,
    pub cohere_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub perplexity_api_key: Option<String>,
    pub ollama_host: Option<String>,
    pub mlx_program: Option<String>,
    pub lmstudio_base_url: Option<String>,
    /// Seeds every new conversation.
    pub system_prompt: Option<String>,
}

impl ProviderSettings {
    /// Non-blank key for `kind`, if any.
    pub fn api_key(&self, kind: ProviderKind) -> Option<&str> {
        let key = match kind {
            ProviderKind::OpenAi => &self.openai_api_key,
            ProviderKind::Anthropic => &self.anthropic_api_key,
            ProviderKind::Mistral => &self.mistral_api_key,
            ProviderKind::Xai => &self.xai_api_key,
            ProviderKind::Cohere => &self.cohere_api_key,
            ProviderKind::Gemini => &self.gemini_api_key,
            ProviderKind::Perplexity => &self.perplexity_api_key,
            ProviderKind::Ollama | ProviderKind::Mlx | ProviderKind::LmStudio => return None,
        };
        key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }

    pub fn is_available(&self, kind: ProviderKind) -> bool {
        !kind.requires_key() || self.api_key(kind).is_some()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub fn build_backend(
    kind: ProviderKind,
    settings: &ProviderSettings,
) -> Result<Arc<dyn Backend>> {
    let key = || {
        settings.api_key(kind).map(str::to_string).ok_or_else(|| {
            LlmError::Config(format!(
                "{kind} requires an api key (set {})",
                kind.api_key_env().unwrap_or("an api key")
            ))
        })
    };
    let backend: Arc<dyn Backend> = match kind {
        ProviderKind::OpenAi => Arc::new(OpenAiCompatible::new(Flavor::OpenAi, key()?)),
        ProviderKind::Mistral => Arc::new(OpenAiCompatible::new(Flavor::Mistral, key()?)),
        ProviderKind::Xai => Arc::new(OpenAiCompatible::new(Flavor::Xai, key()?)),
        ProviderKind::Anthropic => Arc::new(AnthropicBackend::new(key()?)),
        ProviderKind::Cohere => Arc::new(CohereBackend::new(key()?)),
        ProviderKind::Gemini => Arc::new(GeminiBackend::new(key()?)),
        ProviderKind::Perplexity => {
            Arc::new(OpenAiCompatible::new(Flavor::Perplexity, key()?))
        }
        ProviderKind::Ollama => Arc::new(match non_blank(settings.ollama_host.as_deref()) {
            Some(host) => OllamaBackend::new(host),
            None => OllamaBackend::default(),
        }),
        ProviderKind::Mlx => Arc::new(match non_blank(settings.mlx_program.as_deref()) {
            Some(program) => MlxBackend::with_program(program),
            None => MlxBackend::default(),
        }),
        ProviderKind::LmStudio => {
            let backend = OpenAiCompatible::new(Flavor::LmStudio, "");
            Arc::new(match non_blank(settings.lmstudio_base_url.as_deref()) {
                Some(url) => backend.with_base_url(url),
                None => backend,
            })
        }
    };
    Ok(backend)
}

#[tracing::instrument(level = "debug", skip(settings, transport))]
pub fn build_client(
    kind: ProviderKind,
    settings: &ProviderSettings,
    transport: Arc<dyn Transport>,
) -> Result<ChatClient> {
    let backend = build_backend(kind, settings)?;
    Ok(ChatClient::new(backend, transport, settings.system_prompt.clone()))
}

pub fn available_providers(settings: &ProviderSettings) -> BTreeMap<ProviderKind, bool> {
    ProviderKind::ALL
        .iter()
        .map(|kind| (*kind, settings.is_available(*kind)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderClient;
    use crate::transport::testing::StubTransport;
    use futures_util::StreamExt;

    #[test]
    fn kinds_parse_case_insensitively() {
        assert_eq!("OpenAI".parse::<ProviderKind>().expect("openai"), ProviderKind::OpenAi);
        assert_eq!("grok".parse::<ProviderKind>().expect("grok"), ProviderKind::Xai);
        assert_eq!(" Ollama ".parse::<ProviderKind>().expect("ollama"), ProviderKind::Ollama);
        assert_eq!("pplx".parse::<ProviderKind>().expect("pplx"), ProviderKind::Perplexity);
        assert_eq!("LM-Studio".parse::<ProviderKind>().expect("lm"), ProviderKind::LmStudio);
        assert!("watson".parse::<ProviderKind>().is_err());
        for kind in ProviderKind::ALL {
            assert_eq!(kind.as_str().parse::<ProviderKind>().expect("roundtrip"), kind);
        }
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let settings = ProviderSettings {
            anthropic_api_key: Some("   ".to_string()),
            ..ProviderSettings::default()
        };
        let err = build_client(
            ProviderKind::Anthropic,
            &settings,
            Arc::new(StubTransport::new()),
        )
        .err()
        .expect("blank key");
        assert!(matches!(err, LlmError::Config(ref m) if m.contains("ANTHROPIC_API_KEY")), "{err}");
    }

    #[test]
    fn keyless_providers_build_and_carry_system_prompt() {
        let settings = ProviderSettings {
            system_prompt: Some("be brief".to_string()),
            ..ProviderSettings::default()
        };
        let client = build_client(ProviderKind::Ollama, &settings, Arc::new(StubTransport::new()))
            .expect("ollama needs no key");
        assert_eq!(client.provider(), "ollama");
        assert_eq!(client.conversation().system_prompt(), Some("be brief"));
    }

    #[test]
    fn cohere_gets_its_default_system_prompt() {
        let settings = ProviderSettings {
            cohere_api_key: Some("co".to_string()),
            ..ProviderSettings::default()
        };
        let client = build_client(ProviderKind::Cohere, &settings, Arc::new(StubTransport::new()))
            .expect("cohere");
        assert_eq!(
            client.conversation().system_prompt(),
            Some("You are a helpful AI assistant.")
        );
    }

    #[test]
    fn availability_follows_keys() {
        let settings = ProviderSettings {
            openai_api_key: Some("sk".to_string()),
            ..ProviderSettings::default()
        };
        let available = available_providers(&settings);
        assert_eq!(available.len(), ProviderKind::ALL.len());
        assert!(available[&ProviderKind::OpenAi]);
        assert!(!available[&ProviderKind::Gemini]);
        assert!(available[&ProviderKind::Ollama]);
        assert!(available[&ProviderKind::Mlx]);
        assert!(available[&ProviderKind::LmStudio]);
        assert!(!available[&ProviderKind::Perplexity]);
    }

    #[test]
    fn perplexity_needs_its_own_key() {
        let transport = Arc::new(StubTransport::new());
        let err = build_client(
            ProviderKind::Perplexity,
            &ProviderSettings::default(),
            transport.clone(),
        )
        .err()
        .expect("no key");
        assert!(matches!(err, LlmError::Config(ref m) if m.contains("PERPLEXITY_API_KEY")));

        let settings = ProviderSettings {
            perplexity_api_key: Some("pplx-1".to_string()),
            ..ProviderSettings::default()
        };
        let client = build_client(ProviderKind::Perplexity, &settings, transport)
            .expect("perplexity");
        assert_eq!(client.provider(), "perplexity");
    }

    #[tokio::test]
    async fn lmstudio_uses_the_configured_base_url() {
        let stub = Arc::new(StubTransport::new());
        stub.push_body(concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n",
            "data: [DONE]\n\n",
        ));
        let settings = ProviderSettings {
            lmstudio_base_url: Some(" http://studio.lan:1234/v1 ".to_string()),
            ..ProviderSettings::default()
        };
        let mut client = build_client(ProviderKind::LmStudio, &settings, stub.clone())
            .expect("lmstudio needs no key");
        let chunks: Vec<_> = client
            .stream_chat_response(crate::provider::ChatRequest::new("hi"))
            .collect()
            .await;
        assert_eq!(chunks, vec![crate::types::StreamChunk::content("ok")]);
        let request = &stub.requests()[0];
        assert_eq!(request.url, "http://studio.lan:1234/v1/chat/completions");
        assert_eq!(request.header_value("authorization"), None);
    }
}
