//! Prompt construction.
//!
//! A pure function of the controller's state snapshot so identical states
//! produce identical prompts and runs can be replayed from the event log.

use crate::domain::models::{RunConfig, RunMode, VerifyResult};
use crate::services::policy::PolicyDecision;

const FAILURE_OUTPUT_CAP: usize = 45_000;
const REPO_TREE_CAP: usize = 20_000;
const OBSERVATIONS_CAP: usize = 30_000;

/// Everything the prompt builder reads. Assembled fresh each model turn.
pub struct PromptState<'a> {
    pub config: &'a RunConfig,
    pub verify: &'a VerifyResult,
    pub decision: &'a PolicyDecision,
    pub test_cmd: &'a str,
    pub repo_tree: &'a str,
    pub files_block: &'a str,
    pub observations: &'a str,
}

/// Build the model input. Sections are fixed and ordered; truncation caps
/// keep the longest fields bounded.
pub fn build_prompt(state: &PromptState<'_>) -> String {
    let mut sections: Vec<String> = Vec::new();

    match state.config.mode {
        RunMode::Repair => {
            sections.push("GOAL:\nMake the test command succeed (exit code 0).\n".to_string());
            sections.push(format!("INTENT:\n{}\n", state.decision.intent.as_str()));
            sections.push(format!("SUBGOAL:\n{}\n", state.decision.subgoal));
        }
        RunMode::Feature => {
            sections.push(
                "GOAL:\nImplement the described feature and make verification pass.\n".to_string(),
            );
            if let Some(desc) = &state.config.feature_description {
                sections.push(format!("FEATURE_DESCRIPTION:\n{}\n", desc));
            }
            if !state.config.acceptance_criteria.is_empty() {
                let criteria: Vec<String> = state
                    .config
                    .acceptance_criteria
                    .iter()
                    .map(|c| format!("  - {}", c))
                    .collect();
                sections.push(format!("ACCEPTANCE_CRITERIA:\n{}\n", criteria.join("\n")));
            }
            sections.push(format!("SUBGOAL:\n{}\n", state.decision.subgoal));
        }
    }

    sections.push(format!("TEST_COMMAND:\n{}\n", state.test_cmd));
    if let Some(focus) = &state.decision.focus_cmd {
        sections.push(format!("FOCUS_TEST_COMMAND:\n{}\n", focus));
    }
    sections.push(format!(
        "FAILURE_OUTPUT:\n{}\n",
        truncate(&state.verify.combined_output(), FAILURE_OUTPUT_CAP)
    ));
    sections.push(format!("REPO_TREE:\n{}\n", truncate(state.repo_tree, REPO_TREE_CAP)));
    sections.push(format!("CONSTRAINTS:\n{}\n", constraints_text()));
    if !state.files_block.is_empty() {
        sections.push(format!("FILES:\n{}\n", state.files_block));
    }
    if !state.observations.is_empty() {
        sections.push(format!(
            "OBSERVATIONS:\n{}\n",
            truncate(state.observations, OBSERVATIONS_CAP)
        ));
    }

    sections.join("\n")
}

fn constraints_text() -> &'static str {
    "- Reply with a single JSON object: tool_request, patch, or feature_summary.\n\
     - Patch diffs must apply with git apply from the repo root.\n\
     - Minimal edits. No refactors. No reformatting.\n\
     - Commands run without a shell from the repo root: no &&, pipes, redirects, cd, or inline env vars.\n\
     - Do not touch .git/, node_modules/, vendor/, .venv/, dist/, build/, target/."
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n...[truncated]...", &s[..end])
}
