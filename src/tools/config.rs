//! Tool server configuration parsing
//!
//! Accepted shapes: a JSON object `{"servers": [...]}`, a bare JSON array,
//! or a markdown document with a fenced json block holding either.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

static JSON_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```json\s*\n([\s\S]*?)\n\s*```").expect("valid regex")
});

/// How the gateway reaches a tool server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Local subprocess speaking line-delimited JSON-RPC
    Stdio,
    /// One JSON-RPC request per HTTP POST
    Http,
}

/// Registration of one tool server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub transport: TransportKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

/// Server entries from a parsed JSON document
///
/// Entries without a non-empty `name` or a known `transport` are skipped.
#[must_use]
pub fn parse_tools_config(value: &Value) -> Vec<ToolServerConfig> {
    let entries = match value {
        Value::Array(entries) => entries,
        Value::Object(map) => match map.get("servers") {
            Some(Value::Array(entries)) => entries,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    entries
        .iter()
        .filter_map(|entry| match serde_json::from_value::<ToolServerConfig>(entry.clone()) {
            Ok(config) if !config.name.trim().is_empty() => Some(config),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "skipping tool server entry");
                None
            }
        })
        .collect()
}

/// Server entries from the first fenced json block of a markdown document
#[must_use]
pub fn parse_tools_markdown(markdown: &str) -> Vec<ToolServerConfig> {
    let Some(block) = JSON_BLOCK.captures(markdown).and_then(|c| c.get(1)) else {
        return Vec::new();
    };

    match serde_json::from_str::<Value>(block.as_str()) {
        Ok(value) => parse_tools_config(&value),
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse tools markdown json block");
            Vec::new()
        }
    }
}

/// Parse a tools document, JSON first and markdown otherwise
#[must_use]
pub fn parse_tools_document(content: &str) -> Vec<ToolServerConfig> {
    serde_json::from_str::<Value>(content).map_or_else(
        |_| parse_tools_markdown(content),
        |value| parse_tools_config(&value),
    )
}

/// Read and parse a tools document from disk
///
/// # Errors
///
/// Returns error if the file cannot be read
pub fn load_tools_config(path: &Path) -> Result<Vec<ToolServerConfig>> {
    let content = std::fs::read_to_string(path)?;
    let servers = parse_tools_document(&content);
    tracing::debug!(path = %path.display(), count = servers.len(), "parsed tool servers");
    Ok(servers)
}
