//! MCP tool providers
//!
//! Connects to Model Context Protocol servers over stdio child processes or
//! streamable HTTP and exposes their tools through [`ToolProvider`].

use super::{ToolDescriptor, ToolError, ToolOutput, ToolProvider, ToolProviderRegistry};
use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, RawContent};
use rmcp::ServiceExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

type McpClientService = rmcp::service::RunningService<rmcp::service::RoleClient, ()>;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to read server list: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid server list: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Server '{server}' is missing '{field}'")]
    MissingField {
        server: String,
        field: &'static str,
    },
    #[error("Server '{0}' is disabled")]
    Disabled(String),
    #[error("Failed to connect to '{server}': {message}")]
    Connect { server: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    Stdio,
    #[serde(alias = "streamable-http")]
    Http,
}

/// Which conversations a server's tools are offered to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum McpScope {
    #[default]
    Global,
    Conversation,
}

/// One configured MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerEntry {
    pub name: String,
    pub transport: McpTransport,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub scope: McpScope,
    /// Required when `scope` is `conversation`
    #[serde(default)]
    pub conversation_id: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Read a JSON array of server entries
pub fn load_server_entries(path: &Path) -> Result<Vec<McpServerEntry>, McpError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Tool provider backed by one running MCP client session
pub struct McpToolProvider {
    name: String,
    service: McpClientService,
}

impl McpToolProvider {
    pub async fn connect(entry: &McpServerEntry) -> Result<Self, McpError> {
        if !entry.enabled {
            return Err(McpError::Disabled(entry.name.clone()));
        }

        let connect_err = |e: &dyn std::fmt::Display| McpError::Connect {
            server: entry.name.clone(),
            message: e.to_string(),
        };

        let service = match entry.transport {
            McpTransport::Stdio => {
                let command = entry.command.as_ref().ok_or_else(|| McpError::MissingField {
                    server: entry.name.clone(),
                    field: "command",
                })?;
                tracing::info!(server = %entry.name, command = %command, "Connecting MCP server via stdio");

                let mut cmd = tokio::process::Command::new(command);
                cmd.args(&entry.args);
                for (key, value) in &entry.env {
                    cmd.env(key, value);
                }
                let transport =
                    rmcp::transport::TokioChildProcess::new(cmd).map_err(|e| connect_err(&e))?;
                ().serve(transport).await.map_err(|e| connect_err(&e))?
            }
            McpTransport::Http => {
                let url = entry.url.as_ref().ok_or_else(|| McpError::MissingField {
                    server: entry.name.clone(),
                    field: "url",
                })?;
                tracing::info!(server = %entry.name, url = %url, "Connecting MCP server via HTTP");

                let transport =
                    rmcp::transport::StreamableHttpClientTransport::from_uri(url.as_str());
                ().serve(transport).await.map_err(|e| connect_err(&e))?
            }
        };

        Ok(Self {
            name: entry.name.clone(),
            service,
        })
    }
}

#[async_trait]
impl ToolProvider for McpToolProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        let result = self
            .service
            .list_tools(Option::default())
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;

        Ok(result
            .tools
            .iter()
            .map(|t| {
                let schema = serde_json::to_value(&t.input_schema).unwrap_or(Value::Null);
                let description = t.description.as_deref().unwrap_or_default();
                ToolDescriptor::from_schema(t.name.to_string(), description, &schema)
            })
            .collect())
    }

    async fn invoke(&self, tool: &str, parameters: &Value) -> Result<ToolOutput, ToolError> {
        tracing::debug!(server = %self.name, tool = %tool, "Calling MCP tool");

        let result = self
            .service
            .call_tool(CallToolRequestParams {
                meta: None,
                name: tool.to_string().into(),
                arguments: parameters.as_object().cloned(),
                task: None,
            })
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;

        let text = result
            .content
            .iter()
            .filter_map(|c| match &c.raw {
                RawContent::Text(tc) => Some(tc.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if result.is_error.unwrap_or(false) {
            Ok(ToolOutput::Error(text))
        } else {
            Ok(ToolOutput::Content(text))
        }
    }
}

impl ToolProviderRegistry {
    /// Connect every enabled entry and register it in its scope.
    ///
    /// Servers that fail to connect are logged and skipped. Returns the
    /// number of connected servers.
    pub async fn connect_servers(&self, entries: &[McpServerEntry]) -> usize {
        let mut connected = 0;

        for entry in entries.iter().filter(|e| e.enabled) {
            let conversation_id = match (entry.scope, &entry.conversation_id) {
                (McpScope::Global, _) => None,
                (McpScope::Conversation, Some(id)) => Some(id.clone()),
                (McpScope::Conversation, None) => {
                    tracing::warn!(server = %entry.name, "Conversation-scoped server without conversation_id");
                    continue;
                }
            };

            match McpToolProvider::connect(entry).await {
                Ok(provider) => {
                    let provider: Arc<dyn ToolProvider> = Arc::new(provider);
                    match conversation_id {
                        Some(id) => self.attach(&id, provider).await,
                        None => self.add_global(provider).await,
                    }
                    connected += 1;
                }
                Err(e) => {
                    tracing::warn!(server = %entry.name, error = %e, "MCP server unavailable");
                }
            }
        }

        connected
    }
}
