//! Controller phases.
//!
//! The loop is an explicit state machine; every transition is logged before
//! it takes effect.

use serde::{Deserialize, Serialize};

/// Pipeline phases for the controller state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Run the verification plan and compute the failure fingerprint.
    Measure,
    /// Build the prompt and consult the model.
    Model,
    /// Execute validated tool requests through the mediator.
    ApplyTools,
    /// Sample candidate diffs across the temperature list.
    GeneratePatches,
    /// Evaluate surviving candidates in isolated worktrees.
    Evaluate,
    /// Apply the winning diff to the primary working copy.
    ApplyWinner,
    /// Run the full verification contract before declaring success.
    FinalVerify,
    /// Controlled termination without success.
    Bailout,
    /// Terminal success.
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Measure => "measure",
            Self::Model => "model",
            Self::ApplyTools => "apply_tools",
            Self::GeneratePatches => "generate_patches",
            Self::Evaluate => "evaluate",
            Self::ApplyWinner => "apply_winner",
            Self::FinalVerify => "final_verify",
            Self::Bailout => "bailout",
            Self::Done => "done",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Bailout)
    }
}

/// A logged transition between phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Option<Phase>,
    pub to: Phase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl PhaseTransition {
    pub fn new(from: Option<Phase>, to: Phase) -> Self {
        Self { from, to, reason: String::new() }
    }

    pub fn with_reason(from: Option<Phase>, to: Phase, reason: impl Into<String>) -> Self {
        Self { from, to, reason: reason.into() }
    }
}
