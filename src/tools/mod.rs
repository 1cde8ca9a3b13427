//! Tool registry
//!
//! Keeps one [`ToolClient`] per registered, enabled tool server and
//! dispatches calls by qualified name (`server__tool`).

mod client;
pub mod config;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

pub use client::{PROTOCOL_VERSION, REQUEST_TIMEOUT, ToolCallOutput, ToolClient, ToolContent, ToolInfo};
pub use config::{ToolServerConfig, TransportKind, load_tools_config, parse_tools_document};

use crate::{Error, Result};

/// Separator between server and tool in a qualified name
pub const NAME_SEPARATOR: &str = "__";

/// Split `server__tool` at the first separator
///
/// # Errors
///
/// Returns error if the name has no separator
pub fn split_qualified_name(qualified: &str) -> Result<(&str, &str)> {
    qualified.split_once(NAME_SEPARATOR).ok_or_else(|| {
        Error::Tool(format!(
            "Invalid tool name format: {qualified}. Expected: serverName{NAME_SEPARATOR}toolName"
        ))
    })
}

/// Directory of connected tool servers
#[derive(Default)]
pub struct ToolRegistry {
    clients: RwLock<BTreeMap<String, Arc<ToolClient>>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect and register a server
    ///
    /// Returns false without connecting when the server is disabled or a
    /// server of the same name is already registered.
    ///
    /// # Errors
    ///
    /// Returns error if the connection or handshake fails
    pub async fn register(&self, config: ToolServerConfig) -> Result<bool> {
        if !config.enabled {
            tracing::info!(server = %config.name, "skipping disabled tool server");
            return Ok(false);
        }
        if self.clients.read().await.contains_key(&config.name) {
            tracing::warn!(server = %config.name, "tool server already registered");
            return Ok(false);
        }

        let client = Arc::new(ToolClient::connect(config).await?);

        let mut clients = self.clients.write().await;
        if clients.contains_key(client.name()) {
            // Lost a registration race; keep the first
            drop(clients);
            client.disconnect().await;
            return Ok(false);
        }
        clients.insert(client.name().to_string(), Arc::clone(&client));
        tracing::info!(server = %client.name(), "registered tool server");
        Ok(true)
    }

    /// Register several servers, logging failures; returns how many registered
    pub async fn register_all(&self, configs: Vec<ToolServerConfig>) -> usize {
        let mut registered = 0;
        for config in configs {
            let name = config.name.clone();
            match self.register(config).await {
                Ok(true) => registered += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(server = %name, error = %e, "failed to register tool server"),
            }
        }
        registered
    }

    /// Disconnect and forget a server; false if it was not registered
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.clients.write().await.remove(name);
        match removed {
            Some(client) => {
                client.disconnect().await;
                tracing::info!(server = %name, "unregistered tool server");
                true
            }
            None => false,
        }
    }

    /// Disconnect every server
    pub async fn unregister_all(&self) {
        let clients = std::mem::take(&mut *self.clients.write().await);
        for client in clients.values() {
            client.disconnect().await;
        }
    }

    /// Tools of every connected server under qualified names
    pub async fn tools_for_prompt(&self) -> Vec<ToolInfo> {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.is_connected())
            .flat_map(|c| {
                c.tools().iter().map(move |tool| ToolInfo {
                    name: format!("{}{NAME_SEPARATOR}{}", c.name(), tool.name),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                })
            })
            .collect()
    }

    /// Call a tool by qualified name
    ///
    /// # Errors
    ///
    /// Returns error if the name is malformed, the server is unknown or not
    /// connected, or the call itself fails
    pub async fn call_tool(&self, qualified: &str, arguments: Value) -> Result<ToolCallOutput> {
        let (server, tool) = split_qualified_name(qualified)?;

        let client = self
            .clients
            .read()
            .await
            .get(server)
            .cloned()
            .ok_or_else(|| Error::Tool(format!("MCP server not found: {server}")))?;

        if !client.is_connected() {
            return Err(Error::Tool(format!("MCP server not connected: {server}")));
        }

        tracing::debug!(server, tool, "calling tool");
        client.call_tool(tool, arguments).await
    }

    pub async fn connected_count(&self) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.is_connected())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn split_on_first_separator() {
        assert_eq!(
            split_qualified_name("calendar__list__today").unwrap(),
            ("calendar", "list__today")
        );
        let err = split_qualified_name("calendar").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid tool name format: calendar. Expected: serverName__toolName"
        );
    }

    #[tokio::test]
    async fn unknown_server_fails_fast() {
        let registry = ToolRegistry::new();
        let err = registry
            .call_tool("weather__today", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "MCP server not found: weather");
    }

    #[tokio::test]
    async fn disabled_server_is_skipped() {
        let registry = ToolRegistry::new();
        let config = ToolServerConfig {
            name: "off".to_string(),
            transport: TransportKind::Stdio,
            command: Some("does-not-exist".to_string()),
            args: vec![],
            url: None,
            description: None,
            enabled: false,
        };
        assert!(!registry.register(config).await.unwrap());
        assert_eq!(registry.connected_count().await, 0);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = ToolRegistry::new();
        assert!(!registry.unregister("nothing").await);
        registry.unregister_all().await;
        assert!(registry.tools_for_prompt().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn register_and_unregister_stdio_server() {
        let registry = ToolRegistry::new();
        let config = ToolServerConfig {
            name: "echo".to_string(),
            transport: TransportKind::Stdio,
            command: Some("cat".to_string()),
            args: vec![],
            url: None,
            description: None,
            enabled: true,
        };
        assert!(registry.register(config.clone()).await.unwrap());
        assert!(!registry.register(config).await.unwrap());
        assert_eq!(registry.connected_count().await, 1);

        assert!(registry.unregister("echo").await);
        let err = registry.call_tool("echo__x", json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "MCP server not found: echo");
    }
}
