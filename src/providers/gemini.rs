//! Gemini (Google) provider.
//!
//! Maps generation requests onto the Generative Language API's
//! `generateContent` call and normalizes its response shape.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use reqwest::Client;

use super::types::{GenerateRequest, ProviderResponse, TokenUsage};
use super::{Provider, ProviderError, classify_http_status, parse_retry_after};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, serde::Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

// ---------------------------------------------------------------------------
// GeminiProvider
// ---------------------------------------------------------------------------

/// Adapter for the Google Generative Language API.
pub struct GeminiProvider {
    client: Client,
    base_url: String,
    credential: String,
    models: Vec<String>,
}

impl GeminiProvider {
    pub fn new(base_url: Option<String>, credential: String, models: Vec<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            credential,
            models,
        }
    }

    fn generate_url(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            model
        )
    }

    fn build_body(request: &GenerateRequest) -> serde_json::Value {
        let mut generation_config = serde_json::json!({
            "maxOutputTokens": request.params.max_tokens,
        });
        if let Some(temperature) = request.params.temperature {
            generation_config["temperature"] = serde_json::json!(temperature);
        }
        if let Some(top_p) = request.params.top_p {
            generation_config["topP"] = serde_json::json!(top_p);
        }
        if let Some(stop) = &request.params.stop {
            generation_config["stopSequences"] = serde_json::json!(stop);
        }

        let mut body = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": request.prompt}],
            }],
            "generationConfig": generation_config,
        });
        if let Some(system) = &request.params.system {
            body["systemInstruction"] = serde_json::json!({
                "parts": [{"text": system}],
            });
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
            .post(self.generate_url(&request.model))
            .header("x-goog-api-key", &self.credential)
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

        let parsed: GenerateContentResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
        let latency = started.elapsed();

        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::MalformedResponse("response has no candidates".into()))?;
        let text = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::MalformedResponse("candidate has no text parts".into()))?;

        let usage = parsed
            .usage_metadata
            .map(|u| TokenUsage {
                tokens_in: u.prompt_token_count,
                tokens_out: u.candidates_token_count,
            })
            .unwrap_or_default();

        Ok(ProviderResponse {
            text,
            model: request.model,
            usage,
            latency,
            finish_reason: candidate.finish_reason,
        })
    }
}

impl Provider for GeminiProvider {
    fn id(&self) -> &str {
        "gemini"
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
            let url = format!("{}/v1beta/models", self.base_url.trim_end_matches('/'));
            match self
                .client
                .get(url)
                .header("x-goog-api-key", &self.credential)
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
