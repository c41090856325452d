//! Validated model output.
//!
//! The validator is the sole constructor of [`ModelReply`]; the rest of the
//! controller dispatches on the variant and never re-parses raw model text.

use serde::{Deserialize, Serialize};

use super::tool::ToolRequest;

/// Completion claim attached to a feature summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Complete,
    Partial,
    Blocked,
    InProgress,
}

impl CompletionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "complete" => Some(Self::Complete),
            "partial" => Some(Self::Partial),
            "blocked" => Some(Self::Blocked),
            "in_progress" => Some(Self::InProgress),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Blocked => "blocked",
            Self::InProgress => "in_progress",
        }
    }
}

/// One of the three reply modes the model may use.
#[derive(Debug, Clone)]
pub enum ModelReply {
    ToolRequests {
        requests: Vec<ToolRequest>,
        why: String,
    },
    Patch {
        diff: String,
        why: String,
    },
    FeatureSummary {
        summary: String,
        status: CompletionStatus,
    },
}

impl ModelReply {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::ToolRequests { .. } => "tool_request",
            Self::Patch { .. } => "patch",
            Self::FeatureSummary { .. } => "feature_summary",
        }
    }
}

/// Output of the validator: the reply to act on, plus the corrective
/// message when the original output was malformed and a fallback was
/// substituted.
#[derive(Debug, Clone)]
pub struct ValidatedReply {
    pub reply: ModelReply,
    /// `Some` when the raw output violated the contract; the string is fed
    /// back to the model as an observation.
    pub corrective: Option<String>,
    /// Individual tool requests dropped during validation, with reasons.
    pub rejected_requests: Vec<String>,
}

impl ValidatedReply {
    pub fn clean(reply: ModelReply) -> Self {
        Self { reply, corrective: None, rejected_requests: Vec::new() }
    }

    pub fn is_fallback(&self) -> bool {
        self.corrective.is_some()
    }
}
