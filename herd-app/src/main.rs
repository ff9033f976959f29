//! herd: one chat interface over many LLM providers.

mod cli;
mod config;
mod routes;
mod server;
mod session;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "herd", version, about = "Multi-provider LLM chat server and CLI")]
struct Cli {
    /// Config file; defaults to ~/.herd/config.toml.
    #[arg(long, global = true, env = "HERD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server (default).
    Serve,
    /// Send one prompt and stream the reply to stdout.
    Chat(cli::ChatArgs),
    /// List a provider's models.
    Models(cli::ModelsArgs),
    /// Validate config and report which providers are usable.
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let config = cli.config;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(config).await,
        Command::Chat(args) => cli::chat(config, args).await,
        Command::Models(args) => cli::models(config, args).await,
        Command::Doctor => server::doctor(config).await,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new("info,herd=debug,herd_llm=debug,tower_http=info"),
    };
    let log_format = std::env::var("HERD_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    // stdout carries chat output, so logs go to stderr.
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported HERD_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::debug!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["herd"]).expect("parse");
        assert!(cli.command.is_none());
    }

    #[test]
    fn chat_takes_flags_and_a_prompt() {
        let cli = Cli::try_parse_from([
            "herd",
            "--config",
            "/tmp/herd.toml",
            "chat",
            "--provider",
            "anthropic",
            "--max-tokens",
            "64",
            "hi there",
        ])
        .expect("parse");
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/herd.toml")));
        let Some(Command::Chat(args)) = cli.command else {
            panic!("expected chat");
        };
        assert_eq!(args.provider.as_deref(), Some("anthropic"));
        assert_eq!(args.max_tokens, Some(64));
        assert_eq!(args.prompt, "hi there");
    }

    #[test]
    fn models_defaults() {
        let cli = Cli::try_parse_from(["herd", "models", "-p", "openai"]).expect("parse");
        let Some(Command::Models(args)) = cli.command else {
            panic!("expected models");
        };
        assert_eq!(args.sort_by, "created");
        assert_eq!(args.page, 1);
        assert_eq!(args.page_size, 20);
    }

    #[test]
    fn panic_payloads_render_as_text() {
        assert_eq!(panic_payload_to_string(&"boom"), "boom");
        assert_eq!(panic_payload_to_string(&String::from("bang")), "bang");
        assert_eq!(panic_payload_to_string(&42_u8), "non-string panic payload");
    }
}
