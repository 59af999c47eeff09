use std::collections::BTreeSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{
    prompt, status_error, transport_error, AdapterSettings, ProviderAdapter, ProviderError,
    RawModelOutput, TokenUsage,
};
use crate::preprocess::TextSegment;
use crate::task::{AnalysisType, RiskCategory};

const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-3-haiku-20240307";
const API_VERSION: &str = "2023-06-01";

/// Messages API adapter.
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    name: String,
    http: Client,
    url: String,
    api_key: String,
    model: String,
}

impl AnthropicAdapter {
    pub fn new(name: impl Into<String>, settings: &AdapterSettings) -> Result<Self> {
        let base = settings.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        let url = format!("{}/v1/messages", base.trim_end_matches('/'));
        let http = Client::builder()
            .user_agent(concat!("riskflow/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.timeout)
            .build()
            .context("failed to build Anthropic HTTP client")?;
        Ok(Self {
            name: name.into(),
            http,
            url,
            api_key: settings.api_key.clone(),
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    #[instrument(name = "anthropic_infer", skip_all, fields(provider = %self.name))]
    async fn infer(
        &self,
        segments: &[TextSegment],
        analysis_type: AnalysisType,
        risk_categories: &BTreeSet<RiskCategory>,
    ) -> Result<RawModelOutput, ProviderError> {
        let payload = AnthropicRequest {
            model: self.model.clone(),
            system: prompt::SYSTEM_PROMPT.to_string(),
            messages: vec![AnthropicMessage {
                role: "user".into(),
                content: prompt::user_prompt(segments, analysis_type, risk_categories),
            }],
            max_tokens: prompt::MAX_OUTPUT_TOKENS,
            temperature: prompt::TEMPERATURE,
        };

        let response = self
            .http
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let message: AnthropicResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::MalformedResponse(err.to_string()))?;
        let content = message
            .content
            .into_iter()
            .filter_map(|part| part.text)
            .collect::<Vec<_>>()
            .join("\n");
        if content.trim().is_empty() {
            return Err(ProviderError::MalformedResponse(
                "response missing text content".into(),
            ));
        }
        debug!(bytes = content.len(), "message received");

        Ok(RawModelOutput {
            provider: self.name.clone(),
            content,
            self_reported_confidence: None,
            token_usage: message.usage.map(|usage| TokenUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            }),
        })
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    system: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}
