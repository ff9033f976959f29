//! Apple-silicon local inference through the `mlx_lm.generate` command.
//! Output is streamed line by line from the child's stdout.

use crate::backend::{Backend, ChatTurn};
use crate::catalog::static_model;
use crate::error::{LlmError, Result};
use crate::stream::{Delta, DeltaExtractor, FragmentStream, RawStream, WireFormat, decode_lines};
use crate::transport::{ByteStream, HttpRequest, Transport};
use crate::types::{Capability, ModelDescriptor, Role};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::io::ReaderStream;

pub const DEFAULT_MLX_PROGRAM: &str = "mlx_lm.generate";

/// Status lines the generator prints around the completion itself.
const NOISE_MARKERS: [&str; 9] = [
    "Loading",
    "Tokenizing",
    "Prompt:",
    "Generation:",
    "Peak memory",
    "mx.metal",
    "tokens-per-sec",
    "Fetching",
    "==========",
];

#[derive(Clone)]
pub struct MlxBackend {
    program: String,
}

impl MlxBackend {
    pub fn new() -> Self {
        Self::with_program(DEFAULT_MLX_PROGRAM)
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for MlxBackend {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn is_noise(line: &str) -> bool {
    NOISE_MARKERS.iter().any(|m| line.contains(m))
}

/// Flattens the conversation into the `Role: text` transcript the generator
/// expects, ending with an open assistant turn.
pub(crate) fn render_prompt(turn: &ChatTurn<'_>) -> String {
    let mut out = String::new();
    if let Some(system) = turn.system {
        out.push_str(&format!("System: {system}\n"));
    }
    for m in turn.history {
        let role = match m.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        out.push_str(&format!("{role}: {}\n", m.text()));
    }
    out.push_str("Assistant: ");
    out
}

fn no_json_events(_: &serde_json::Value) -> Delta {
    Delta::Skip
}

#[async_trait]
impl Backend for MlxBackend {
    fn name(&self) -> &'static str {
        "mlx"
    }

    fn default_model(&self) -> &str {
        "mlx-community/Llama-3.2-3B-Instruct-4bit"
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::Fragments
    }

    fn delta_extractor(&self) -> DeltaExtractor {
        no_json_events
    }

    fn default_max_tokens(&self) -> u32 {
        4096
    }

    fn fallback_models(&self) -> Vec<ModelDescriptor> {
        use Capability::*;
        vec![
            static_model(
                "mlx",
                "mlx-community/Llama-3.2-3B-Instruct-4bit",
                "Llama 3.2 3B Instruct (4-bit)",
                &[Text],
                8192,
                "",
            ),
            static_model(
                "mlx",
                "mlx-community/Qwen2-7B-Instruct-4bit",
                "Qwen2 7B Instruct (4-bit)",
                &[Text],
                8192,
                "",
            ),
            static_model(
                "mlx",
                "mlx-community/Mistral-7B-Instruct-v0.3-4bit",
                "Mistral 7B Instruct v0.3 (4-bit)",
                &[Text],
                8192,
                "",
            ),
        ]
    }

    fn models_request(&self) -> Result<Option<HttpRequest>> {
        Ok(None)
    }

    fn parse_models(&self, _body: &serde_json::Value) -> Result<Vec<ModelDescriptor>> {
        Ok(Vec::new())
    }

    fn stream_request(&self, _turn: &ChatTurn<'_>) -> Result<HttpRequest> {
        Err(LlmError::Unsupported(
            "mlx runs as a local subprocess, not over http".to_string(),
        ))
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(program = %self.program, model = %turn.model)
    )]
    async fn open_chat(
        &self,
        _transport: &dyn Transport,
        turn: &ChatTurn<'_>,
    ) -> Result<RawStream> {
        let mut child = Command::new(&self.program)
            .arg("--model")
            .arg(turn.model)
            .arg("--prompt")
            .arg(render_prompt(turn))
            .arg("--max-tokens")
            .arg(turn.max_tokens.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LlmError::Io(format!("failed to start {}: {e}", self.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LlmError::Io(format!("{} has no stdout", self.program)))?;
        let program = self.program.clone();

        let fragments: FragmentStream = Box::pin(async_stream::stream! {
            let bytes: ByteStream =
                Box::pin(ReaderStream::new(stdout).map(|r| r.map_err(LlmError::from)));
            let mut lines = Box::pin(decode_lines(bytes));
            let mut first = true;
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => {
                        let line = line.trim_end();
                        if line.is_empty() || is_noise(line) {
                            continue;
                        }
                        if first {
                            first = false;
                            yield Ok(line.to_string());
                        } else {
                            yield Ok(format!("\n{line}"));
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => yield Err(LlmError::Io(format!("{program} exited with {status}"))),
                Err(e) => yield Err(LlmError::from(e)),
            }
        });

        Ok(RawStream::Fragments(fragments))
    }
}
