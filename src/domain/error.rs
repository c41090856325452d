//! Error types for the rfsn controller.
//!
//! Failures inside the loop are values, not exceptions: gates return their
//! own result types and these enums cover the cases that must propagate.
//! The loop perimeter is the only catch-all.

use thiserror::Error;

/// Errors detected before the loop starts. All of these abort the run with
/// exit code 2.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The repository URL failed validation
    #[error("Invalid repository URL: {0}")]
    UrlInvalid(String),

    /// No API key is present for the selected model provider
    #[error("Missing API key for model '{model}': set {env_var}")]
    ModelProviderMissing { model: String, env_var: String },

    /// The temperature list must be non-empty
    #[error("Temperature list cannot be empty")]
    EmptyTemperatures,

    /// Feature mode requires a feature description
    #[error("Feature mode requires --feature-description")]
    MissingFeatureDescription,

    /// A flag value is out of range or inconsistent
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Settings could not be loaded from the environment
    #[error("Failed to load settings: {0}")]
    SettingsLoad(String),
}

/// Errors raised by sandbox operations.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Cloning the target repository failed
    #[error("Clone failed: {0}")]
    CloneFailed(String),

    /// argv[0] is not in the effective allowlist for this project
    #[error("Command '{command}' is not allowed for this project type. Some allowed commands: {hint}")]
    CommandNotAllowed { command: String, hint: String },

    /// The command string used shell syntax that cannot execute (shell=false)
    #[error("Shell syntax rejected: {0}")]
    ShellIdiomRejected(String),

    /// A path argument escaped the repository root or touched a forbidden prefix
    #[error("Path rejected: {0}")]
    PathRejected(String),

    /// `git apply` refused the diff
    #[error("Patch failed to apply: {0}")]
    PatchApplyFailed(String),

    /// Worktree creation or removal failed
    #[error("Worktree operation failed: {0}")]
    WorktreeFailed(String),

    /// Underlying process could not be spawned
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

impl SandboxError {
    /// True when the error should be surfaced to the model as a corrective
    /// observation rather than terminating anything.
    pub const fn is_observation(&self) -> bool {
        matches!(
            self,
            Self::CommandNotAllowed { .. } | Self::ShellIdiomRejected(_) | Self::PathRejected(_)
        )
    }
}

/// Errors from the model client.
#[derive(Error, Debug)]
pub enum ModelError {
    /// HTTP transport failure
    #[error("Model request failed: {0}")]
    RequestFailed(String),

    /// Provider returned a non-success status
    #[error("Model provider error {status}: {message}")]
    ApiError { status: u16, message: String },

    /// Request exceeded the client timeout
    #[error("Model request timed out after {0}s")]
    Timeout(u64),
}

impl ModelError {
    /// Transient errors are retried with backoff; permanent ones are not.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed(_) | Self::Timeout(_) => true,
            Self::ApiError { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

/// Causes recorded when a run terminates without success. A failed final
/// verification is not terminal by itself (the loop keeps going), so it is
/// an event kind rather than a bailout cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BailoutCause {
    /// No reduction in failing tests for the configured number of steps
    NoProgress,
    /// Bounded run exhausted its step budget
    MaxStepsReached,
    /// An unexpected error escaped to the loop perimeter
    UnexpectedException(String),
}

impl BailoutCause {
    pub fn as_str(&self) -> &str {
        match self {
            Self::NoProgress => "no_progress",
            Self::MaxStepsReached => "max_steps_reached",
            Self::UnexpectedException(_) => "unexpected_exception",
        }
    }
}
