//! Model provider interface.
//!
//! The controller consumes providers through [`ModelClient`]; the HTTP
//! implementation is the only one shipped, tests substitute scripted
//! clients.

pub mod http;
pub mod types;

use async_trait::async_trait;

use crate::domain::error::ModelError;

pub use http::{HttpModelClient, HttpModelConfig};

/// A model endpoint: prompt + temperature in, UTF-8 JSON document out.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, prompt: &str, temperature: f32) -> Result<String, ModelError>;

    fn model_id(&self) -> &str;
}

/// Default endpoint for a model id. Providers are routed by prefix; a
/// custom endpoint comes from `RFSN_MODEL_BASE_URL`.
pub fn default_base_url(model: &str) -> String {
    if let Ok(url) = std::env::var("RFSN_MODEL_BASE_URL") {
        return url;
    }
    if model.starts_with("deepseek") {
        "https://api.deepseek.com".to_string()
    } else if model.starts_with("gemini") {
        "https://generativelanguage.googleapis.com".to_string()
    } else {
        "https://api.openai.com".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_routing_by_prefix() {
        std::env::remove_var("RFSN_MODEL_BASE_URL");
        assert!(default_base_url("deepseek-r1").contains("deepseek"));
        assert!(default_base_url("gemini-2.0-flash").contains("googleapis"));
    }
}
