//! rfsn - a verification-grounded autonomous code-repair and
//! feature-implementation controller.
//!
//! Given a public repository and either a failing test command or a feature
//! description, the controller drives a model through a bounded loop:
//! measure, classify, consult, mediate tool use, evaluate candidate patches
//! in isolated git worktrees, and apply a winner only after it passes
//! verification in isolation. Success is only ever declared after an
//! empirical `FINAL_VERIFY` pass.

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::{BailoutCause, ConfigError, ModelError, SandboxError};
pub use services::{Controller, RunOutcome};
