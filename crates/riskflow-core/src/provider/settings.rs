use anyhow::{bail, Context, Result};
use std::{collections::HashMap, time::Duration};

use super::{ProviderConfig, ProviderKind};

/// Connection settings for an HTTP-backed adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSettings {
    pub api_key: String,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub timeout: Duration,
}

impl AdapterSettings {
    const OPENAI_KEY_ENV: &'static str = "OPENAI_API_KEY";
    const ANTHROPIC_KEY_ENV: &'static str = "ANTHROPIC_API_KEY";

    /// Resolve settings for `config`, reading the API key from the process environment.
    pub fn resolve(config: &ProviderConfig) -> Result<Self> {
        Self::from_map(config, std::env::vars().collect())
    }

    fn from_map(config: &ProviderConfig, vars: HashMap<String, String>) -> Result<Self> {
        let key_env = match (&config.api_key_env, config.kind) {
            (Some(name), _) => name.trim().to_string(),
            (None, ProviderKind::OpenAi) => Self::OPENAI_KEY_ENV.to_string(),
            (None, ProviderKind::Anthropic) => Self::ANTHROPIC_KEY_ENV.to_string(),
            (None, ProviderKind::Heuristic) => {
                bail!("provider `{}` does not use API credentials", config.name)
            }
        };
        let api_key = vars
            .get(&key_env)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .with_context(|| {
                format!(
                    "environment variable {} must be set for provider `{}`",
                    key_env, config.name
                )
            })?;
        let endpoint = config
            .endpoint
            .clone()
            .filter(|value| !value.trim().is_empty());
        let model = config
            .model
            .clone()
            .filter(|value| !value.trim().is_empty());

        Ok(Self {
            api_key,
            endpoint,
            model,
            timeout: config.timeout,
        })
    }
}
