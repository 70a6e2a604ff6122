//! OpenAI-compatible provider.
//!
//! Speaks the chat-completions API shared by OpenAI and the many gateways
//! that clone it, so one adapter covers any backend reachable at a
//! configurable base URL with a bearer credential.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use reqwest::Client;

use super::types::{GenerateRequest, ProviderResponse, TokenUsage};
use super::{Provider, ProviderError, classify_http_status, parse_retry_after};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Deserialize)]
struct OaiResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<OaiChoice>,
    #[serde(default)]
    usage: Option<OaiUsage>,
}

#[derive(Debug, serde::Deserialize)]
struct OaiChoice {
    #[serde(default)]
    message: Option<OaiMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct OaiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct OaiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

// ---------------------------------------------------------------------------
// OpenAiProvider
// ---------------------------------------------------------------------------

/// Adapter for OpenAI-compatible chat-completions backends.
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    credential: String,
    models: Vec<String>,
}

impl OpenAiProvider {
    pub fn new(base_url: Option<String>, credential: String, models: Vec<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            credential,
            models,
        }
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    fn build_body(request: &GenerateRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.params.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.prompt}));

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.params.max_tokens,
        });
        if let Some(temperature) = request.params.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(top_p) = request.params.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if let Some(stop) = &request.params.stop {
            body["stop"] = serde_json::json!(stop);
        }
        body
    }

    async fn generate_inner(
        &self,
        request: GenerateRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        if !self.supports_model(&request.model) {
            return Err(ProviderError::InvalidRequest(format!(
                "model '{}' is not served by this backend",
                request.model
            )));
        }

        let body = Self::build_body(&request);
        let started = Instant::now();

        let resp = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.credential)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_http_status(status.as_u16(), text, retry_after));
        }

        let latency = started.elapsed();
        let parsed: OaiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::MalformedResponse("response has no choices".into()))?;
        let text = choice
            .message
            .and_then(|m| m.content)
            .ok_or_else(|| ProviderError::MalformedResponse("choice has no content".into()))?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                tokens_in: u.prompt_tokens,
                tokens_out: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(ProviderResponse {
            text,
            model: if parsed.model.is_empty() {
                request.model
            } else {
                parsed.model
            },
            usage,
            latency,
            finish_reason: choice.finish_reason,
        })
    }
}

impl Provider for OpenAiProvider {
    fn id(&self) -> &str {
        "openai"
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn supports_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }

    fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderResponse, ProviderError>> + Send + '_>> {
        let request = request.clone();
        Box::pin(self.generate_inner(request))
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            let url = format!("{}/v1/models", self.base_url.trim_end_matches('/'));
            match self
                .client
                .get(url)
                .bearer_auth(&self.credential)
                .send()
                .await
            {
                Ok(resp) => resp.status().is_success(),
                Err(_) => false,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
