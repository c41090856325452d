//! HTTP model client.
//!
//! Connection-pooled reqwest client with bounded exponential backoff on
//! transient failures. Provider specifics stay behind the base URL and the
//! bearer key; the controller never sees HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as ReqwestClient;
use tracing::{debug, warn};

use crate::domain::error::ModelError;

use super::types::{CompletionRequest, CompletionResponse};
use super::ModelClient;

/// Configuration for the HTTP model client.
#[derive(Debug, Clone)]
pub struct HttpModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
}

impl HttpModelConfig {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs: 180,
            max_retries: 3,
            initial_backoff_ms: 1_000,
        }
    }
}

/// Production model client speaking JSON over HTTPS.
pub struct HttpModelClient {
    http: ReqwestClient,
    config: HttpModelConfig,
}

impl HttpModelClient {
    pub fn new(config: HttpModelConfig) -> Result<Self, ModelError> {
        let http = ReqwestClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| ModelError::RequestFailed(e.to_string()))?;
        Ok(Self { http, config })
    }

    async fn send_once(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        let response = self
            .http
            .post(format!("{}/v1/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout(self.config.timeout_secs)
                } else {
                    ModelError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::ApiError { status: status.as_u16(), message });
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ModelError::RequestFailed(format!("bad response body: {}", e)))?;
        Ok(parsed.output)
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(&self, prompt: &str, temperature: f32) -> Result<String, ModelError> {
        let request = CompletionRequest::new(&self.config.model, prompt, temperature);
        let mut backoff = Duration::from_millis(self.config.initial_backoff_ms);
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match self.send_once(&request).await {
                Ok(output) => {
                    debug!(attempt, temperature, "model reply received");
                    return Ok(output);
                }
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    warn!(attempt, error = %e, "transient model error, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ModelError::RequestFailed("retries exhausted".into())))
    }

    fn model_id(&self) -> &str {
        &self.config.model
    }
}
