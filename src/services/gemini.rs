use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::config::ApiConfig;
use crate::core::errors::{CoreError, CoreResult};
use crate::core::types::{mask_secret, CloudModel, Credential};
use crate::services::providers::{CloudProvider, CloudRequest, TranslationProvider};

/// Longest single backoff between retries
const MAX_RETRY_DELAY_MS: u64 = 10_000;

#[derive(Debug, Error)]
enum GeminiError {
    #[error("model {0} is not available")]
    ModelUnavailable(String),

    #[error("API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<GeminiError> for CoreError {
    fn from(e: GeminiError) -> Self {
        CoreError::provider(format!("{:#}", e))
    }
}

/// Gemini REST client used for cloud recognition, translation and key probes
pub struct GeminiClient {
    base_url: String,
    http_client: reqwest::Client,
    request_timeout: Duration,
    max_retries: u32,
    probe_prompt: String,
}

impl GeminiClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        // Create HTTP client with connection pooling; per-request timeouts
        // are set in send_with_retries
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http_client,
            request_timeout: config.request_timeout,
            max_retries: config.max_retries,
            probe_prompt: config.probe_prompt.clone(),
        })
    }

    fn endpoint(&self, model: CloudModel) -> String {
        format!("{}/models/{}:generateContent", self.base_url, model.provider_id())
    }

    fn timeout_for(&self, model: CloudModel) -> Duration {
        if model.is_slow() {
            self.request_timeout * 2
        } else {
            self.request_timeout
        }
    }

    /// One model, retrying transient failures with exponential backoff + jitter
    async fn send_with_retries(
        &self,
        model: CloudModel,
        api_key: &str,
        request_body: &serde_json::Value,
    ) -> std::result::Result<String, GeminiError> {
        let url = self.endpoint(model);
        let timeout = self.timeout_for(model);

        for attempt in 0..=self.max_retries {
            let response = self
                .http_client
                .post(&url)
                .header("x-goog-api-key", api_key)
                .timeout(timeout)
                .json(request_body)
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    let text = response
                        .text()
                        .await
                        .context("Failed to read response body")?;
                    return Ok(text);
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let message = response.text().await.unwrap_or_default();

                    if status == 404 {
                        return Err(GeminiError::ModelUnavailable(model.provider_id().to_string()));
                    }

                    let retryable = matches!(status, 429 | 500 | 502 | 503 | 504);
                    if !retryable || attempt == self.max_retries {
                        return Err(GeminiError::Api {
                            status,
                            message: summarize_error(&message),
                        });
                    }

                    debug!(
                        "Gemini returned {} for key {}, retrying ({}/{})",
                        status,
                        mask_secret(api_key),
                        attempt + 1,
                        self.max_retries
                    );
                }
                Err(e) => {
                    if attempt == self.max_retries {
                        return Err(anyhow::Error::new(e)
                            .context("HTTP request failed after retries")
                            .into());
                    }
                    debug!(
                        "HTTP request error: {}. Retrying ({}/{})",
                        e,
                        attempt + 1,
                        self.max_retries
                    );
                }
            }

            tokio::time::sleep(backoff_delay(attempt)).await;
        }

        Err(anyhow::anyhow!("Failed after {} retries", self.max_retries).into())
    }

    /// Walk `model` then `fallback_models`, skipping models the API reports
    /// as unavailable
    async fn generate_with_fallbacks(
        &self,
        api_key: &str,
        request_body: &serde_json::Value,
        model: CloudModel,
        fallback_models: &[CloudModel],
    ) -> std::result::Result<String, GeminiError> {
        let mut last_error = None;

        for candidate in std::iter::once(model).chain(fallback_models.iter().copied()) {
            match self.send_with_retries(candidate, api_key, request_body).await {
                Ok(body) => {
                    let response: serde_json::Value =
                        serde_json::from_str(&body).context("Failed to parse API response")?;
                    return Ok(extract_text(&response)?);
                }
                Err(GeminiError::ModelUnavailable(id)) => {
                    warn!("Model {} unavailable, trying next fallback", id);
                    last_error = Some(GeminiError::ModelUnavailable(id));
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("No model to try").into()))
    }
}

#[async_trait]
impl CloudProvider for GeminiClient {
    #[instrument(skip(self, credential, request), fields(key = %credential.id))]
    async fn generate_text(
        &self,
        credential: &Credential,
        request: &CloudRequest,
        model: CloudModel,
        fallback_models: &[CloudModel],
    ) -> CoreResult<String> {
        let body = build_request_body(request);
        Ok(self
            .generate_with_fallbacks(&credential.secret, &body, model, fallback_models)
            .await?)
    }

    async fn probe(&self, secret: &str) -> CoreResult<String> {
        let body = build_request_body(&CloudRequest::Prompt(self.probe_prompt.clone()));
        Ok(self
            .generate_with_fallbacks(secret, &body, CloudModel::Fast, &CloudModel::Fast.fallbacks())
            .await?)
    }
}

#[async_trait]
impl TranslationProvider for GeminiClient {
    #[instrument(skip(self, credential, text), fields(key = %credential.id, chars = text.len()))]
    async fn translate(
        &self,
        credential: &Credential,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        model: CloudModel,
    ) -> CoreResult<String> {
        let prompt = translation_prompt(text, source_lang, target_lang);
        let body = build_request_body(&CloudRequest::Prompt(prompt));
        let translated = self
            .generate_with_fallbacks(&credential.secret, &body, model, &model.fallbacks())
            .await?;
        Ok(translated.trim().to_string())
    }
}

fn translation_prompt(text: &str, source_lang: &str, target_lang: &str) -> String {
    let source = if source_lang.eq_ignore_ascii_case("auto") {
        "the detected source language".to_string()
    } else {
        format!("language code '{}'", source_lang)
    };
    format!(
        "Translate the following text from {} to language code '{}'. \
         Only output the translation, nothing else.\n\n{}",
        source, target_lang, text
    )
}

fn build_request_body(request: &CloudRequest) -> serde_json::Value {
    let parts = match request {
        CloudRequest::Prompt(prompt) => serde_json::json!([{ "text": prompt }]),
        CloudRequest::Image { image, prompt } => {
            let base64_image = general_purpose::STANDARD.encode(image.bytes.as_slice());
            serde_json::json!([
                {
                    "inline_data": {
                        "mime_type": image.mime_type,
                        "data": base64_image
                    }
                },
                { "text": prompt }
            ])
        }
    };

    serde_json::json!({
        "contents": [{ "parts": parts }],
        "generationConfig": {
            "temperature": 0.2,
            "maxOutputTokens": 4096,
            "thinkingConfig": { "thinking_budget": 0 }
        }
    })
}

/// Concatenated text parts of the first candidate
fn extract_text(response: &serde_json::Value) -> Result<String> {
    let parts = response["candidates"][0]["content"]["parts"]
        .as_array()
        .context("Missing content parts in API response")?;

    let text: String = parts
        .iter()
        .filter_map(|p| p["text"].as_str())
        .collect::<Vec<_>>()
        .join("");

    if text.is_empty() {
        let reason = response["candidates"][0]["finishReason"]
            .as_str()
            .unwrap_or("unknown");
        anyhow::bail!("Empty response from model (finish reason: {})", reason);
    }
    Ok(text)
}

/// Pull the human-readable message out of a Gemini error body
fn summarize_error(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = 1000u64.saturating_mul(2u64.saturating_pow(attempt));
    let jitter = rand::random::<u64>() % 1000;
    Duration::from_millis(base.min(MAX_RETRY_DELAY_MS) + jitter)
}
