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

const DEFAULT_ENDPOINT: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Chat-completions adapter.
#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    name: String,
    http: Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenAiAdapter {
    pub fn new(name: impl Into<String>, settings: &AdapterSettings) -> Result<Self> {
        let base = settings.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        let url = format!("{}/v1/chat/completions", base.trim_end_matches('/'));
        let http = Client::builder()
            .user_agent(concat!("riskflow/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.timeout)
            .build()
            .context("failed to build OpenAI HTTP client")?;
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
impl ProviderAdapter for OpenAiAdapter {
    #[instrument(name = "openai_infer", skip_all, fields(provider = %self.name))]
    async fn infer(
        &self,
        segments: &[TextSegment],
        analysis_type: AnalysisType,
        risk_categories: &BTreeSet<RiskCategory>,
    ) -> Result<RawModelOutput, ProviderError> {
        let payload = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: prompt::SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt::user_prompt(segments, analysis_type, risk_categories),
                },
            ],
            temperature: prompt::TEMPERATURE,
            max_tokens: prompt::MAX_OUTPUT_TOKENS,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let chat: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::MalformedResponse(err.to_string()))?;
        let content = chat
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty());
        let Some(content) = content else {
            return Err(ProviderError::MalformedResponse(
                "response missing message content".into(),
            ));
        };
        debug!(bytes = content.len(), "completion received");

        Ok(RawModelOutput {
            provider: self.name.clone(),
            content,
            self_reported_confidence: None,
            token_usage: chat.usage.map(|usage| TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            }),
        })
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::segment_text;
    use httpmock::prelude::*;
    use std::time::Duration;

    fn settings(url: String) -> AdapterSettings {
        AdapterSettings {
            api_key: "test-key".into(),
            endpoint: Some(url),
            model: Some("gpt-test".into()),
            timeout: Duration::from_secs(5),
        }
    }

    fn segments() -> Vec<TextSegment> {
        segment_text("The supplier's liability is unlimited.", 200)
    }

    #[test]
    fn builds_completions_url() {
        let settings = settings("http://localhost:1/".into());
        let adapter = OpenAiAdapter::new("primary", &settings).unwrap();
        assert_eq!(adapter.url, "http://localhost:1/v1/chat/completions");
        assert_eq!(adapter.model, "gpt-test");
    }

    #[tokio::test]
    #[ignore = "requires loopback networking"]
    async fn infer_returns_message_content() {
        let server = MockServer::start();
        let body = concat!(
            r#"{"choices":[{"message":{"content":"{\"findings\":[]}"}}],"#,
            r#""usage":{"prompt_tokens":12,"completion_tokens":3}}"#
        );
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer test-key");
            then.status(200)
                .header("content-type", "application/json")
                .body(body);
        });

        let adapter = OpenAiAdapter::new("primary", &settings(server.base_url())).unwrap();
        let output = adapter
            .infer(&segments(), AnalysisType::Quick, &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(output.provider, "primary");
        assert_eq!(output.content, "{\"findings\":[]}");
        assert_eq!(
            output.token_usage,
            Some(TokenUsage {
                input_tokens: 12,
                output_tokens: 3
            })
        );
        mock.assert();
    }

    #[tokio::test]
    #[ignore = "requires loopback networking"]
    async fn rate_limit_is_quota_exceeded() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(429).body("slow down");
        });
        let adapter = OpenAiAdapter::new("primary", &settings(server.base_url())).unwrap();
        let err = adapter
            .infer(&segments(), AnalysisType::Quick, &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::QuotaExceeded(msg) if msg.contains("slow down")));
    }

    #[tokio::test]
    #[ignore = "requires loopback networking"]
    async fn server_error_is_unavailable_without_retry() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(503);
        });
        let adapter = OpenAiAdapter::new("primary", &settings(server.base_url())).unwrap();
        let err = adapter
            .infer(&segments(), AnalysisType::Quick, &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
        mock.assert_hits(1);
    }

    #[tokio::test]
    #[ignore = "requires loopback networking"]
    async fn empty_content_is_malformed() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"choices":[{"message":{"content":null}}]}"#);
        });
        let adapter = OpenAiAdapter::new("primary", &settings(server.base_url())).unwrap();
        let err = adapter
            .infer(&segments(), AnalysisType::Quick, &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse(_)));
    }
}
