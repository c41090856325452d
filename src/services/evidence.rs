//! Evidence pack export.
//!
//! On success (and best-effort on bailout) the run's winning diff, outputs,
//! and metadata are materialized under `results/run_<UTC>_<runid>/` in a
//! shape suitable for fine-tuning corpora and audit.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::domain::models::RunConfig;
use crate::services::hygiene;

/// Everything the exporter needs, collected by the loop as it runs.
#[derive(Debug, Default)]
pub struct EvidenceInputs {
    pub winner_diff: Option<String>,
    pub baseline_output: String,
    pub final_output: String,
    pub failing_tests_before: usize,
    pub failing_tests_after: usize,
    pub steps_taken: u64,
    pub tool_requests_used: usize,
    pub command_log: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct Metadata<'a> {
    run_id: &'a str,
    timestamp: String,
    repo_url: &'a str,
    model: &'a str,
    mode: &'a str,
    diff_hash: Option<String>,
    files_changed: Vec<String>,
    lines_added: usize,
    lines_removed: usize,
    failing_tests_before: usize,
    failing_tests_after: usize,
    steps_taken: u64,
    tool_requests_used: usize,
}

/// Materialize `winner.diff`, `evidence_pack.json`, and `metadata.json`.
/// Returns the created directory.
pub fn export_pack(
    results_dir: &Path,
    run_id: &str,
    config: &RunConfig,
    inputs: &EvidenceInputs,
) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let run_dir = results_dir.join(format!("run_{}_{}", stamp, &run_id[..8.min(run_id.len())]));
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create {}", run_dir.display()))?;

    let (diff_hash, stats) = match &inputs.winner_diff {
        Some(diff) => {
            std::fs::write(run_dir.join("winner.diff"), diff)
                .context("failed to write winner.diff")?;
            (
                Some(crate::domain::models::diff_hash(diff)),
                Some(hygiene::parse_diff(diff)),
            )
        }
        None => (None, None),
    };

    let metadata = Metadata {
        run_id,
        timestamp: Utc::now().to_rfc3339(),
        repo_url: &config.repo_url,
        model: &config.model,
        mode: config.mode.as_str(),
        diff_hash: diff_hash.clone(),
        files_changed: stats
            .as_ref()
            .map(|s| s.files.iter().cloned().collect())
            .unwrap_or_default(),
        lines_added: stats.as_ref().map(|s| s.lines_added).unwrap_or(0),
        lines_removed: stats.as_ref().map(|s| s.lines_removed).unwrap_or(0),
        failing_tests_before: inputs.failing_tests_before,
        failing_tests_after: inputs.failing_tests_after,
        steps_taken: inputs.steps_taken,
        tool_requests_used: inputs.tool_requests_used,
    };

    let pack = json!({
        "metadata": &metadata,
        "winner_diff": &inputs.winner_diff,
        "failing_output_before": &inputs.baseline_output,
        "passing_output_after": &inputs.final_output,
        "command_log": &inputs.command_log,
        "config": config,
    });

    std::fs::write(
        run_dir.join("evidence_pack.json"),
        serde_json::to_string_pretty(&pack)?,
    )
    .context("failed to write evidence_pack.json")?;

    std::fs::write(
        run_dir.join("metadata.json"),
        serde_json::to_string_pretty(&metadata)?,
    )
    .context("failed to write metadata.json")?;

    info!(dir = %run_dir.display(), "evidence pack exported");
    Ok(run_dir)
}
