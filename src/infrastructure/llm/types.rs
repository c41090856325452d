//! Wire types for the model provider interface.
//!
//! The controller treats providers uniformly: a prompt and a temperature
//! go in, a UTF-8 JSON document comes back. Off-schema replies are the
//! validator's problem, not the transport's.

use serde::{Deserialize, Serialize};

/// Request sent to the completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    /// Hint that the reply must be a JSON document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(model: &str, prompt: &str, temperature: f32) -> Self {
        Self {
            model: model.to_string(),
            prompt: prompt.to_string(),
            temperature,
            response_format: Some("json".to_string()),
            max_tokens: Some(8192),
        }
    }
}

/// Response from the completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// The model's reply text (expected to be a JSON document).
    pub output: String,
    #[serde(default)]
    pub model: Option<String>,
}
