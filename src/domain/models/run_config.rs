//! Immutable per-run configuration.

use serde::{Deserialize, Serialize};

use crate::domain::error::ConfigError;

/// What the run is trying to achieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Make an existing failing test command pass.
    Repair,
    /// Implement a described feature and verify it against acceptance criteria.
    Feature,
}

impl RunMode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Repair => "repair",
            Self::Feature => "feature",
        }
    }
}

/// Which predicates gate `FINAL_VERIFY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyPolicy {
    /// Only the test command must pass.
    TestsOnly,
    /// Verify commands first, then the test command.
    CmdsThenTests,
    /// Only the verify commands; the test command is skipped.
    CmdsOnly,
}

/// Optional overrides for the patch hygiene gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HygieneOverrides {
    pub max_lines_changed: Option<usize>,
    pub max_files_changed: Option<usize>,
    pub allow_lockfile_changes: bool,
}

/// Configuration for a single run. Built once at startup, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Normalized public GitHub URL of the target repository.
    pub repo_url: String,
    /// Optional ref to check out after cloning.
    pub git_ref: Option<String>,
    pub mode: RunMode,
    /// Test command; auto-derived from the detected language when absent.
    pub test_cmd: Option<String>,
    pub feature_description: Option<String>,
    pub acceptance_criteria: Vec<String>,
    /// `None` means unbounded (fix-all).
    pub max_steps: Option<u64>,
    pub max_steps_without_progress: u64,
    /// Sampling temperatures for candidate generation. Index 0 is the
    /// tie-break preference when multiple candidates pass simultaneously.
    pub temperatures: Vec<f32>,
    pub model: String,
    pub verify_policy: VerifyPolicy,
    pub focused_verify_cmds: Vec<String>,
    pub extra_verify_cmds: Vec<String>,
    pub hygiene: HygieneOverrides,
    pub collect_evidence: bool,
}

impl RunConfig {
    pub const DEFAULT_TEMPERATURES: [f32; 3] = [0.0, 0.2, 0.4];

    /// Check internal consistency. Any error here is a startup error
    /// (exit code 2).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.temperatures.is_empty() {
            return Err(ConfigError::EmptyTemperatures);
        }
        if self.mode == RunMode::Feature && self.feature_description.is_none() {
            return Err(ConfigError::MissingFeatureDescription);
        }
        if let Some(0) = self.max_steps {
            return Err(ConfigError::InvalidValue {
                field: "max_steps".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.max_steps_without_progress == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_steps_without_progress".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            repo_url: String::new(),
            git_ref: None,
            mode: RunMode::Repair,
            test_cmd: None,
            feature_description: None,
            acceptance_criteria: Vec::new(),
            max_steps: Some(12),
            max_steps_without_progress: 10,
            temperatures: Self::DEFAULT_TEMPERATURES.to_vec(),
            model: "deepseek-r1".to_string(),
            verify_policy: VerifyPolicy::TestsOnly,
            focused_verify_cmds: Vec::new(),
            extra_verify_cmds: Vec::new(),
            hygiene: HygieneOverrides::default(),
            collect_evidence: false,
        }
    }
}
