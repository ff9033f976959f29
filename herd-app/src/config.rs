//! herd configuration loader.
//!
//! A TOML file (default `~/.herd/config.toml`) provides the baseline; the
//! environment overrides keys, hosts and the default provider.

use herd_llm::{ProviderKind, ProviderSettings};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HerdConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub providers: ProviderSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    300
}

fn default_http_max_in_flight() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub default_provider: ProviderKind,
    /// Empty means each backend's own default model.
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub default_max_tokens: Option<u32>,
    /// Outbound provider request timeout.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            default_model: None,
            default_max_tokens: None,
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

fn default_provider() -> ProviderKind {
    ProviderKind::Ollama
}

fn default_request_timeout_seconds() -> u64 {
    120
}

impl HerdConfig {
    /// Load from `path`, or from the default location when `None`. A missing
    /// default file yields built-in defaults; a missing explicit file is an
    /// error.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);

        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                tracing::info!(path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Blank values are ignored.
    pub fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        let p = &mut self.providers;
        for (name, slot) in [
            ("OPENAI_API_KEY", &mut p.openai_api_key),
            ("ANTHROPIC_API_KEY", &mut p.anthropic_api_key),
            ("MISTRAL_API_KEY", &mut p.mistral_api_key),
            ("XAI_API_KEY", &mut p.xai_api_key),
            ("COHERE_API_KEY", &mut p.cohere_api_key),
            ("GEMINI_API_KEY", &mut p.gemini_api_key),
            ("PERPLEXITY_API_KEY", &mut p.perplexity_api_key),
            ("OLLAMA_HOST", &mut p.ollama_host),
            ("LMSTUDIO_BASE_URL", &mut p.lmstudio_base_url),
        ] {
            if let Some(v) = var(name) {
                *slot = Some(v);
            }
        }
        if let Some(v) = var("HERD_PROVIDER") {
            match v.parse::<ProviderKind>() {
                Ok(kind) => self.llm.default_provider = kind,
                Err(e) => tracing::warn!(error = %e, "ignoring HERD_PROVIDER"),
            }
        }
        if let Some(v) = var("HERD_MODEL") {
            self.llm.default_model = Some(v);
        }
        if let Some(v) = var("HERD_BIND_ADDR") {
            self.server.bind_addr = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_addr()?;
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.llm.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("llm.request_timeout_seconds must be > 0"));
        }
        if self.llm.default_max_tokens == Some(0) {
            return Err(anyhow::anyhow!("llm.default_max_tokens must be > 0 when set"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("server.bind_addr {:?}: {e}", self.server.bind_addr))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.request_timeout_seconds)
    }

    pub fn default_model(&self) -> String {
        self.llm
            .default_model
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    }

    /// Configured default model when `kind` is the default provider; empty
    /// otherwise, leaving the choice to the backend.
    pub fn default_model_for(&self, kind: ProviderKind) -> String {
        if kind == self.llm.default_provider {
            self.default_model()
        } else {
            String::new()
        }
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".herd").join("config.toml")
}
