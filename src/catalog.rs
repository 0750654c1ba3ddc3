//! Tool catalog: descriptors of the tools reachable from a conversation
//!
//! Providers are queried fresh for every orchestration call. A provider that
//! cannot be reached, or does not answer in time, simply contributes no tools.

pub mod mcp;

use crate::runtime::TurnOptions;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

pub use mcp::{
    load_server_entries, McpError, McpScope, McpServerEntry, McpToolProvider, McpTransport,
};

// ============================================================================
// Descriptors and outputs
// ============================================================================

/// Immutable description of one callable tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// Required parameter names, in declared order
    #[serde(default)]
    pub required_parameters: Vec<String>,
    #[serde(default)]
    pub parameter_descriptions: BTreeMap<String, String>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required_parameters: vec![],
            parameter_descriptions: BTreeMap::new(),
        }
    }

    /// Declare a required parameter (appended after existing ones)
    #[must_use]
    pub fn with_required(
        mut self,
        parameter: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let parameter = parameter.into();
        self.parameter_descriptions
            .insert(parameter.clone(), description.into());
        self.required_parameters.push(parameter);
        self
    }

    /// Build a descriptor from a JSON Schema `inputSchema`.
    ///
    /// Reads `required` (order kept) and `properties.*.description`.
    pub fn from_schema(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: &Value,
    ) -> Self {
        let required_parameters = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let parameter_descriptions = schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .filter_map(|(key, prop)| {
                        prop.get("description")
                            .and_then(Value::as_str)
                            .map(|d| (key.clone(), d.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: name.into(),
            description: description.into(),
            required_parameters,
            parameter_descriptions,
        }
    }

    /// Human-readable description of a parameter, falling back to its name
    pub fn parameter_description<'a>(&'a self, parameter: &'a str) -> &'a str {
        self.parameter_descriptions
            .get(parameter)
            .map_or(parameter, String::as_str)
    }
}

/// What a provider returned for one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutput {
    Content(String),
    /// The tool ran but reported failure
    Error(String),
}

/// Failure to reach or run a tool
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Tool transport error: {0}")]
    Transport(String),
    #[error("Tool timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Source of tools, e.g. one MCP server connection
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Provider name used in logs
    fn name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError>;

    async fn invoke(&self, tool: &str, parameters: &Value) -> Result<ToolOutput, ToolError>;
}

// ============================================================================
// Catalog snapshot
// ============================================================================

/// Tools available to one conversation at one point in time.
///
/// Invocation is routed to the provider that listed the tool.
#[derive(Clone, Default)]
pub struct ToolCatalog {
    entries: Vec<(ToolDescriptor, Arc<dyn ToolProvider>)>,
}

impl ToolCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Query each provider in order. Failing or slow providers are skipped;
    /// on a duplicate tool name the earlier provider wins.
    ///
    /// Each listing gets `timeout`, shortened by the turn's deadline. Once the
    /// turn is cancelled no further provider is queried.
    pub async fn collect(
        providers: &[Arc<dyn ToolProvider>],
        opts: &TurnOptions,
        timeout: Duration,
    ) -> Self {
        let mut entries: Vec<(ToolDescriptor, Arc<dyn ToolProvider>)> = Vec::new();

        for provider in providers {
            let limit = opts.bounded(timeout);
            let listed = tokio::select! {
                biased;
                () = opts.cancel.cancelled() => {
                    tracing::info!(provider = %provider.name(), "Turn cancelled, stopping tool listing");
                    break;
                }
                result = tokio::time::timeout(limit, provider.list_tools()) => {
                    result.unwrap_or_else(|_| Err(ToolError::Timeout(limit)))
                }
            };

            let tools = match listed {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::warn!(provider = %provider.name(), error = %e, "Tool provider unavailable");
                    continue;
                }
            };

            for tool in tools {
                if let Some((_, owner)) = entries.iter().find(|(d, _)| d.name == tool.name) {
                    tracing::warn!(
                        tool = %tool.name,
                        kept = %owner.name(),
                        ignored = %provider.name(),
                        "Duplicate tool name"
                    );
                    continue;
                }
                entries.push((tool, Arc::clone(provider)));
            }
        }

        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.entries
            .iter()
            .map(|(d, _)| d)
            .find(|d| d.name == name)
    }

    pub fn tools(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.entries.iter().map(|(d, _)| d)
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools().cloned().collect()
    }

    pub async fn invoke(&self, tool: &str, parameters: &Value) -> Result<ToolOutput, ToolError> {
        let (_, provider) = self
            .entries
            .iter()
            .find(|(d, _)| d.name == tool)
            .ok_or_else(|| ToolError::NotFound(tool.to_string()))?;
        provider.invoke(tool, parameters).await
    }
}

impl std::fmt::Debug for ToolCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(d, p)| (&d.name, p.name())))
            .finish()
    }
}

// ============================================================================
// Provider registry
// ============================================================================

/// Owns tool provider connections for the lifetime of the application.
///
/// Global providers serve every conversation; scoped providers serve only the
/// conversation they were attached to and are consulted after the globals.
#[derive(Default)]
pub struct ToolProviderRegistry {
    global: RwLock<Vec<Arc<dyn ToolProvider>>>,
    scoped: RwLock<HashMap<String, Vec<Arc<dyn ToolProvider>>>>,
}

impl ToolProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_global(&self, provider: Arc<dyn ToolProvider>) {
        tracing::info!(provider = %provider.name(), "Registered global tool provider");
        self.global.write().await.push(provider);
    }

    pub async fn attach(&self, conversation_id: &str, provider: Arc<dyn ToolProvider>) {
        tracing::info!(
            conv_id = %conversation_id,
            provider = %provider.name(),
            "Attached conversation tool provider"
        );
        self.scoped
            .write()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .push(provider);
    }

    /// Providers applicable to a conversation, globals first
    pub async fn providers_for(&self, conversation_id: &str) -> Vec<Arc<dyn ToolProvider>> {
        let mut providers = self.global.read().await.clone();
        if let Some(scoped) = self.scoped.read().await.get(conversation_id) {
            providers.extend(scoped.iter().cloned());
        }
        providers
    }

    /// Fresh catalog snapshot for one conversation
    pub async fn catalog_for(
        &self,
        conversation_id: &str,
        opts: &TurnOptions,
        timeout: Duration,
    ) -> ToolCatalog {
        // Locks are released before providers are queried
        let providers = self.providers_for(conversation_id).await;
        ToolCatalog::collect(&providers, opts, timeout).await
    }
}
