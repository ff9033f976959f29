//! Tool definitions on the way to a vendor and tool calls on the way back.

use crate::error::{LlmError, Result};
use crate::types::{ToolCall, ToolDefinition};
use std::collections::{HashMap, HashSet};

const MAX_TOOL_NAME_LEN: usize = 64;

/// Rejects names no vendor could accept even after sanitization.
pub fn validate_tool_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(LlmError::InvalidInput("tool name is empty".to_string()));
    }
    if name.len() > MAX_TOOL_NAME_LEN {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} is longer than {MAX_TOOL_NAME_LEN} characters"
        )));
    }
    if let Some(ch) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')))
    {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} contains unsupported character {ch:?}"
        )));
    }
    Ok(())
}

/// Sanitized name -> caller's original name.
#[derive(Debug, Clone, Default)]
pub struct ToolNameMap {
    reverse: HashMap<String, String>,
}

impl ToolNameMap {
    pub fn original<'a>(&'a self, sanitized: &'a str) -> &'a str {
        self.reverse
            .get(sanitized)
            .map(String::as_str)
            .unwrap_or(sanitized)
    }

    pub fn restore(&self, calls: &mut [ToolCall]) {
        for call in calls {
            if let Some(orig) = self.reverse.get(&call.function_name) {
                call.function_name = orig.clone();
            }
        }
    }
}

/// Rewrites names to `^[a-zA-Z0-9_-]+$`, suffixing collisions, and returns
/// the map needed to translate tool calls back. Emitted names are unique and
/// at most 64 characters.
pub fn sanitize_tools(tools: &[ToolDefinition]) -> (Vec<ToolDefinition>, ToolNameMap) {
    let mut used: HashSet<String> = HashSet::new();
    let mut map = ToolNameMap::default();
    let mut out = Vec::with_capacity(tools.len());

    for t in tools {
        let base = sanitize_tool_name(&t.name);
        let mut name = truncated(&base, "");
        let mut n = 0;
        while used.contains(&name) {
            n += 1;
            name = truncated(&base, &format!("_{n}"));
        }
        used.insert(name.clone());
        map.reverse.insert(name.clone(), t.name.clone());
        out.push(ToolDefinition {
            name,
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        });
    }

    (out, map)
}

// Sanitized names are ASCII, so byte truncation is safe.
fn truncated(base: &str, suffix: &str) -> String {
    let keep = base.len().min(MAX_TOOL_NAME_LEN - suffix.len());
    format!("{}{suffix}", &base[..keep])
}

pub fn sanitize_tool_name(name: &str) -> String {
    let out: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        "tool".to_string()
    } else {
        out
    }
}

/// Prompt text for vendors with no native tool calling.
pub fn embed_tools_in_prompt(prompt: &str, tools: &[ToolDefinition]) -> String {
    if tools.is_empty() {
        return prompt.to_string();
    }
    let mut out = String::from("You can use the following tools:\n");
    for t in tools {
        out.push_str(&format!(
            "\n- {}: {}\n  parameters: {}\n",
            t.name, t.description, t.parameters
        ));
    }
    out.push_str(
        "\nTo call a tool, reply with only a JSON object of the form \
         {\"tool\": \"<name>\", \"arguments\": {...}}. Otherwise answer normally.\n\n",
    );
    out.push_str("Request: ");
    out.push_str(prompt);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: format!("{name} tool"),
            parameters: json!({}),
        }
    }

    #[test]
    fn tool_names_are_sanitized_and_unique() {
        let tools = vec![tool("shell.execute"), tool("shell_execute")];
        let (sanitized, map) = sanitize_tools(&tools);
        assert_eq!(sanitized.len(), 2);
        for t in &sanitized {
            assert!(t.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        }
        assert_ne!(sanitized[0].name, sanitized[1].name);
        assert_eq!(map.original(&sanitized[0].name), "shell.execute");
        assert_eq!(map.original(&sanitized[1].name), "shell_execute");
    }

    #[test]
    fn suffixes_never_reuse_a_literal_name() {
        let tools = vec![tool("a.b"), tool("a_b"), tool("a_b_1")];
        let (sanitized, map) = sanitize_tools(&tools);
        let names: HashSet<&str> = sanitized.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names.len(), 3);
        for (t, orig) in sanitized.iter().zip(["a.b", "a_b", "a_b_1"]) {
            assert_eq!(map.original(&t.name), orig);
        }
    }

    #[test]
    fn suffixed_long_names_stay_within_limit() {
        let long = "x".repeat(64);
        let (sanitized, map) = sanitize_tools(&[tool(&long), tool(&long)]);
        assert_eq!(sanitized[0].name, long);
        assert_eq!(sanitized[1].name.len(), 64);
        assert!(sanitized[1].name.ends_with("_1"));
        assert_eq!(map.original(&sanitized[1].name), long);
    }

    #[test]
    fn restore_maps_sanitized_calls_back() {
        let (sanitized, map) = sanitize_tools(&[tool("fs.read")]);
        let mut calls = vec![
            ToolCall {
                id: "call_1".to_string(),
                function_name: sanitized[0].name.clone(),
                arguments_json: "{}".to_string(),
            },
            ToolCall {
                id: "call_2".to_string(),
                function_name: "unknown".to_string(),
                arguments_json: "{}".to_string(),
            },
        ];
        map.restore(&mut calls);
        assert_eq!(calls[0].function_name, "fs.read");
        assert_eq!(calls[1].function_name, "unknown");
    }

    #[test]
    fn validation_rejects_empty_long_and_spaced_names() {
        assert!(validate_tool_name("weather.lookup").is_ok());
        assert!(validate_tool_name("").is_err());
        assert!(validate_tool_name("has space").is_err());
        assert!(validate_tool_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn embedded_prompt_lists_every_tool() {
        let text = embed_tools_in_prompt("what time is it", &[tool("clock"), tool("tz")]);
        assert!(text.contains("- clock: clock tool"));
        assert!(text.contains("- tz: tz tool"));
        assert!(text.ends_with("Request: what time is it"));
        assert_eq!(embed_tools_in_prompt("plain", &[]), "plain");
    }
}
