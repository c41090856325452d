//! Environment-backed settings.
//!
//! Programmatic defaults merged with `RFSN_*` environment variables.
//! A run is otherwise fully specified by its command line.

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::error::ConfigError;

/// Host-level settings that are not per-run flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Default model when `--model` is not given (`RFSN_MODEL`).
    pub model: String,
    /// Where disposable sandboxes are rooted (`RFSN_SANDBOX_BASE`);
    /// system temp dir when unset.
    pub sandbox_base: Option<PathBuf>,
    /// Tracing filter level (`RFSN_LOG_LEVEL`).
    pub log_level: String,
    /// `pretty` or `json` (`RFSN_LOG_FORMAT`).
    pub log_format: String,
    /// Directory for evidence packs (`RFSN_RESULTS_DIR`).
    pub results_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: "deepseek-r1".to_string(),
            sandbox_base: None,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            results_dir: PathBuf::from("results"),
        }
    }
}

impl Settings {
    /// Load settings: defaults first, `RFSN_*` environment on top.
    pub fn load() -> Result<Self, ConfigError> {
        let settings: Settings = Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Env::prefixed("RFSN_"))
            .extract()
            .map_err(|e| ConfigError::SettingsLoad(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "log_level".into(),
                reason: format!("'{}' is not one of {:?}", self.log_level, LEVELS),
            });
        }
        if !["pretty", "json"].contains(&self.log_format.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "log_format".into(),
                reason: format!("'{}' must be 'pretty' or 'json'", self.log_format),
            });
        }
        Ok(())
    }

    /// Environment variable that must hold the API key for a model, derived
    /// from the provider prefix of the model id (`deepseek-r1` →
    /// `DEEPSEEK_API_KEY`).
    pub fn provider_env_key(model: &str) -> String {
        let provider = model.split(['-', '/', ':']).next().unwrap_or(model);
        format!("{}_API_KEY", provider.to_ascii_uppercase())
    }

    /// Resolve the API key for the selected model, or the startup error
    /// that aborts with exit code 2.
    pub fn require_api_key(model: &str) -> Result<String, ConfigError> {
        let env_var = Self::provider_env_key(model);
        std::env::var(&env_var).map_err(|_| ConfigError::ModelProviderMissing {
            model: model.to_string(),
            env_var,
        })
    }
}
