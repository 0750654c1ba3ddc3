//! Model registry for managing available LLM providers

use super::anthropic::{AnthropicModel, AnthropicService};
use super::openai::{OpenAIModel, OpenAIService};
use super::{LlmError, LlmService, LoggingService};
use std::collections::HashMap;
use std::sync::Arc;

/// Configuration for LLM providers
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    /// Gateway base URL; when set, the gateway handles authentication
    pub gateway: Option<String>,
    /// Default model ID
    pub default_model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            gateway: std::env::var("LLM_GATEWAY").ok(),
            default_model: std::env::var("DEFAULT_MODEL").ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAI,
}

/// A model the registry knows how to construct
struct ModelDef {
    id: &'static str,
    provider: Provider,
    factory: fn(String, Option<&str>) -> Result<Arc<dyn LlmService>, LlmError>,
}

const MODELS: &[ModelDef] = &[
    ModelDef {
        id: "claude-4.5-sonnet",
        provider: Provider::Anthropic,
        factory: |key, gateway| {
            Ok(Arc::new(AnthropicService::new(
                key,
                AnthropicModel::Claude45Sonnet,
                gateway,
            )?))
        },
    },
    ModelDef {
        id: "claude-4.5-haiku",
        provider: Provider::Anthropic,
        factory: |key, gateway| {
            Ok(Arc::new(AnthropicService::new(
                key,
                AnthropicModel::Claude45Haiku,
                gateway,
            )?))
        },
    },
    ModelDef {
        id: "gpt-4o",
        provider: Provider::OpenAI,
        factory: |key, gateway| Ok(Arc::new(OpenAIService::new(key, OpenAIModel::GPT4o, gateway)?)),
    },
    ModelDef {
        id: "gpt-4o-mini",
        provider: Provider::OpenAI,
        factory: |key, gateway| {
            Ok(Arc::new(OpenAIService::new(
                key,
                OpenAIModel::GPT4oMini,
                gateway,
            )?))
        },
    },
];

const PREFERRED_DEFAULT: &str = "claude-4.5-sonnet";

/// Registry of available LLM models
pub struct ModelRegistry {
    services: HashMap<String, Arc<dyn LlmService>>,
    default_model: String,
}

impl ModelRegistry {
    pub fn new(config: &LlmConfig) -> Self {
        let mut services: HashMap<String, Arc<dyn LlmService>> = HashMap::new();

        for model_def in MODELS {
            if let Some(service) = Self::try_create_model(model_def, config) {
                services.insert(model_def.id.to_string(), service);
            }
        }

        let default_model = config
            .default_model
            .clone()
            .or_else(|| {
                if services.contains_key(PREFERRED_DEFAULT) {
                    Some(PREFERRED_DEFAULT.to_string())
                } else {
                    MODELS
                        .iter()
                        .find(|m| services.contains_key(m.id))
                        .map(|m| m.id.to_string())
                }
            })
            .unwrap_or_else(|| PREFERRED_DEFAULT.to_string());

        Self {
            services,
            default_model,
        }
    }

    fn try_create_model(model_def: &ModelDef, config: &LlmConfig) -> Option<Arc<dyn LlmService>> {
        // In gateway mode the gateway handles the actual authentication
        let api_key = if config.gateway.is_some() {
            "implicit".to_string()
        } else {
            match model_def.provider {
                Provider::Anthropic => config.anthropic_api_key.as_ref()?,
                Provider::OpenAI => config.openai_api_key.as_ref()?,
            }
            .clone()
        };

        if api_key.is_empty() {
            return None;
        }

        match (model_def.factory)(api_key, config.gateway.as_deref()) {
            Ok(service) => Some(Arc::new(LoggingService::new(service))),
            Err(e) => {
                tracing::warn!(model = %model_def.id, error = %e, "Failed to create model");
                None
            }
        }
    }

    /// Get a model by ID
    pub fn get(&self, model_id: &str) -> Option<Arc<dyn LlmService>> {
        self.services.get(model_id).cloned()
    }

    /// Get the default model
    pub fn default_model(&self) -> Option<Arc<dyn LlmService>> {
        self.get(&self.default_model)
    }

    pub fn default_model_id(&self) -> &str {
        &self.default_model
    }

    /// List all available model IDs
    pub fn available_models(&self) -> Vec<String> {
        let mut models: Vec<_> = self.services.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn has_models(&self) -> bool {
        !self.services.is_empty()
    }
}
