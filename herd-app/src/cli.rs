//! One-shot commands that talk to a provider without starting the server.

use crate::config::HerdConfig;
use crate::server::{ClientFactory, ConfiguredClients};
use anyhow::Result;
use clap::Args;
use futures_util::StreamExt;
use herd_llm::{
    ChatRequest, ImageInput, ModelDescriptor, ModelQuery, ProviderClient, ProviderKind, SortKey,
    StreamChunk,
};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct ChatArgs {
    /// Provider name; defaults to `llm.default_provider`.
    #[arg(long, short)]
    pub provider: Option<String>,
    #[arg(long, short)]
    pub model: Option<String>,
    #[arg(long)]
    pub max_tokens: Option<u32>,
    /// Attach a local image to the prompt.
    #[arg(long)]
    pub image: Option<PathBuf>,
    #[arg(long)]
    pub system_prompt: Option<String>,
    #[arg(long)]
    pub temperature: Option<f32>,
    pub prompt: String,
}

#[derive(Debug, Args)]
pub struct ModelsArgs {
    #[arg(long, short)]
    pub provider: Option<String>,
    #[arg(long, default_value = "created")]
    pub sort_by: String,
    #[arg(long, default_value_t = 1)]
    pub page: usize,
    #[arg(long, default_value_t = 20)]
    pub page_size: usize,
    /// Only models with this capability (text, vision, function, audio, image-generation).
    #[arg(long)]
    pub capability: Option<String>,
}

fn resolve_kind(cfg: &HerdConfig, provider: Option<&str>) -> Result<ProviderKind> {
    match provider.map(str::trim).filter(|p| !p.is_empty()) {
        Some(name) => Ok(name.parse()?),
        None => Ok(cfg.llm.default_provider),
    }
}

pub async fn chat(config_path: Option<PathBuf>, args: ChatArgs) -> Result<()> {
    let (cfg, _) = HerdConfig::load_with_path(config_path).await?;
    let kind = resolve_kind(&cfg, args.provider.as_deref())?;
    let mut client = ConfiguredClients::from_config(&cfg).build(kind)?;

    let mut request = ChatRequest::new(args.prompt)
        .model(args.model.unwrap_or_else(|| cfg.default_model_for(kind)))
        .max_tokens(args.max_tokens.or(cfg.llm.default_max_tokens));
    if let Some(path) = args.image {
        request = request.image(ImageInput::Path(path));
    }
    if let Some(system_prompt) = args.system_prompt {
        request = request.system_prompt(system_prompt);
    }
    if let Some(temperature) = args.temperature {
        request = request.temperature(temperature);
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    stream_to(client.as_mut(), request, &mut out).await?;
    writeln!(out)?;
    Ok(())
}

/// Write each content chunk as it arrives. An error chunk ends the command.
pub async fn stream_to(
    client: &mut dyn ProviderClient,
    request: ChatRequest,
    out: &mut impl Write,
) -> Result<()> {
    let mut chunks = client.stream_chat_response(request);
    while let Some(chunk) = chunks.next().await {
        match chunk {
            StreamChunk::Content { content } => {
                out.write_all(content.as_bytes())?;
                out.flush()?;
            }
            StreamChunk::Error { error } => return Err(anyhow::anyhow!(error)),
        }
    }
    Ok(())
}

pub async fn models(config_path: Option<PathBuf>, args: ModelsArgs) -> Result<()> {
    let (cfg, _) = HerdConfig::load_with_path(config_path).await?;
    let kind = resolve_kind(&cfg, args.provider.as_deref())?;
    let client = ConfiguredClients::from_config(&cfg).build(kind)?;

    let mut query = ModelQuery::default()
        .sort_by(args.sort_by.parse::<SortKey>()?)
        .page(args.page, args.page_size);
    if let Some(capability) = args.capability.as_deref() {
        query = query.capability(capability.parse()?);
    }
    let models = client.list_models(&query).await;
    let stdout = std::io::stdout();
    render_models(&models, &mut stdout.lock())?;
    Ok(())
}

pub fn render_models(models: &[ModelDescriptor], out: &mut impl Write) -> Result<()> {
    if models.is_empty() {
        writeln!(out, "no models")?;
        return Ok(());
    }
    for model in models {
        let capabilities: Vec<&str> = model.capabilities.iter().map(|c| c.as_str()).collect();
        writeln!(
            out,
            "{:<40} {:>8}  {:<10}  {}",
            model.id,
            model.context_length,
            model.created_at.format("%Y-%m-%d"),
            capabilities.join(",")
        )?;
    }
    Ok(())
}
