//! Gemini API client for quote extraction and comparison.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::GeminiConfig;
use crate::error::ProviderError;
use crate::retry::RetryPolicy;

/// A generative model that turns an ordered list of prompt parts into text.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn generate(&self, parts: &[PromptPart]) -> Result<String, ProviderError>;
}

/// Gemini client for `generateContent`.
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    /// Build a client from config. Returns `None` when no API key is set.
    pub fn from_config(config: &GeminiConfig) -> Option<Self> {
        let api_key = config.api_key.clone()?;
        Some(Self {
            client: Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl ModelProvider for GeminiClient {
    async fn generate(&self, parts: &[PromptPart]) -> Result<String, ProviderError> {
        let url = format!("{}/models/{}:generateContent", self.api_url, self.model);
        let request = GenerateContentRequest {
            contents: vec![Content { role: "user", parts }],
        };

        debug!(
            "Sending request to Gemini: model={}, parts={}, bytes={}",
            self.model,
            parts.len(),
            parts.iter().map(PromptPart::len).sum::<usize>()
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::transport(format!("Failed to send request to Gemini: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::http(
                status.as_u16(),
                format!("Gemini API error ({}): {}", status, error_text),
            ));
        }

        let response: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::transport(format!("Failed to parse Gemini response: {}", e)))?;

        if let Some(usage) = &response.usage_metadata {
            info!(
                "Gemini response: {} tokens (prompt: {}, completion: {})",
                usage.total_token_count, usage.prompt_token_count, usage.candidates_token_count
            );
        }

        response_text(response)
    }
}

/// Wraps a provider so every call goes through the retry policy.
#[derive(Clone)]
pub struct RetryingModel {
    provider: Arc<dyn ModelProvider>,
    policy: RetryPolicy<ProviderError>,
}

impl RetryingModel {
    pub fn new(provider: Arc<dyn ModelProvider>, policy: RetryPolicy<ProviderError>) -> Self {
        Self { provider, policy }
    }

    pub async fn invoke(&self, parts: &[PromptPart]) -> Result<String, ProviderError> {
        let provider = self.provider.as_ref();
        self.policy.run(move || provider.generate(parts)).await
    }
}

/// Concatenate the text parts of the first candidate.
fn response_text(response: GenerateContentResponse) -> Result<String, ProviderError> {
    let block_reason = response.prompt_feedback.and_then(|f| f.block_reason);

    let candidate = response.candidates.into_iter().next().ok_or_else(|| {
        let reason = block_reason.unwrap_or_else(|| "no candidates returned".to_string());
        ProviderError::transport(format!("Gemini returned no content: {}", reason))
    })?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        let reason = candidate
            .finish_reason
            .unwrap_or_else(|| "empty response".to_string());
        return Err(ProviderError::transport(format!(
            "Gemini returned no content: {}",
            reason
        )));
    }

    Ok(text)
}

// ============================================================================
// Prompt parts
// ============================================================================

/// One part of a prompt: text, or a document inlined as base64.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum PromptPart {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

impl PromptPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// `data` must already be base64 encoded.
    pub fn inline(mime_type: impl Into<String>, data: String) -> Self {
        Self::InlineData {
            inline_data: InlineData {
                mime_type: mime_type.into(),
                data,
            },
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Text { text } => text.len(),
            Self::InlineData { inline_data } => inline_data.data.len(),
        }
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: &'a [PromptPart],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}
