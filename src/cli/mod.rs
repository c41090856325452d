//! Command-line surface and run wiring.
//!
//! Exit codes: 0 when the run reaches DONE, 1 on BAILOUT, 2 for
//! configuration errors caught before the loop starts.

use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use tracing::info;

use crate::domain::error::ConfigError;
use crate::domain::models::{HygieneOverrides, RunConfig, RunMode, VerifyPolicy};
use crate::infrastructure::event_log::EventLog;
use crate::infrastructure::llm::{default_base_url, HttpModelClient, HttpModelConfig, ModelClient};
use crate::infrastructure::sandbox::Sandbox;
use crate::infrastructure::settings::Settings;
use crate::services::allowlist::effective_allowlist;
use crate::services::controller::Controller;
use crate::services::project_detector::detect_language;
use crate::services::url_validation::validate_repo_url;

/// Autonomous code-repair and feature-implementation agent.
#[derive(Debug, Parser)]
#[command(name = "rfsn", version, about)]
pub struct Cli {
    /// Public GitHub repository URL (https://github.com/OWNER/REPO)
    #[arg(long)]
    pub repo: String,

    /// Git ref to check out after cloning
    #[arg(long)]
    pub r#ref: Option<String>,

    /// Test command to satisfy (auto-derived from the project when omitted)
    #[arg(long)]
    pub test: Option<String>,

    /// Maximum controller steps before giving up
    #[arg(long, default_value_t = 12)]
    pub steps: u64,

    /// Run without a step bound until tests pass or progress stalls
    #[arg(long, default_value_t = false)]
    pub fix_all: bool,

    /// Bail out after this many steps without reducing failing tests
    #[arg(long, default_value_t = 10)]
    pub max_steps_without_progress: u64,

    /// Model identifier (default from RFSN_MODEL)
    #[arg(long)]
    pub model: Option<String>,

    /// Export an evidence pack even on bailout
    #[arg(long, default_value_t = false)]
    pub collect_finetuning_data: bool,

    /// Implement a feature instead of repairing tests
    #[arg(long, default_value_t = false)]
    pub feature_mode: bool,

    /// What to build (feature mode)
    #[arg(long)]
    pub feature_description: Option<String>,

    /// Acceptance criterion (repeatable)
    #[arg(long = "acceptance-criteria")]
    pub acceptance_criteria: Vec<String>,

    /// Which predicates gate FINAL_VERIFY
    #[arg(long, value_enum, default_value = "tests_only")]
    pub verify_policy: VerifyPolicyArg,

    /// Focused verification command (repeatable)
    #[arg(long = "focused-verify-cmd")]
    pub focused_verify_cmds: Vec<String>,

    /// Extra verification command (repeatable)
    #[arg(long = "verify-cmd-extra")]
    pub extra_verify_cmds: Vec<String>,

    /// Override the hygiene line budget
    #[arg(long)]
    pub max_lines_changed: Option<usize>,

    /// Override the hygiene file budget
    #[arg(long)]
    pub max_files_changed: Option<usize>,

    /// Permit candidate diffs to touch lockfiles
    #[arg(long, default_value_t = false)]
    pub allow_lockfile_changes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum VerifyPolicyArg {
    #[value(name = "tests_only")]
    TestsOnly,
    #[value(name = "cmds_then_tests")]
    CmdsThenTests,
    #[value(name = "cmds_only")]
    CmdsOnly,
}

impl From<VerifyPolicyArg> for VerifyPolicy {
    fn from(arg: VerifyPolicyArg) -> Self {
        match arg {
            VerifyPolicyArg::TestsOnly => VerifyPolicy::TestsOnly,
            VerifyPolicyArg::CmdsThenTests => VerifyPolicy::CmdsThenTests,
            VerifyPolicyArg::CmdsOnly => VerifyPolicy::CmdsOnly,
        }
    }
}

impl Cli {
    /// Build the immutable run configuration, validating as we go.
    pub fn into_run_config(self, settings: &Settings) -> Result<RunConfig, ConfigError> {
        let repo_url = validate_repo_url(&self.repo)?;
        let config = RunConfig {
            repo_url,
            git_ref: self.r#ref,
            mode: if self.feature_mode { RunMode::Feature } else { RunMode::Repair },
            test_cmd: self.test,
            feature_description: self.feature_description,
            acceptance_criteria: self.acceptance_criteria,
            max_steps: if self.fix_all { None } else { Some(self.steps) },
            max_steps_without_progress: self.max_steps_without_progress,
            temperatures: RunConfig::DEFAULT_TEMPERATURES.to_vec(),
            model: self.model.unwrap_or_else(|| settings.model.clone()),
            verify_policy: self.verify_policy.into(),
            focused_verify_cmds: self.focused_verify_cmds,
            extra_verify_cmds: self.extra_verify_cmds,
            hygiene: HygieneOverrides {
                max_lines_changed: self.max_lines_changed,
                max_files_changed: self.max_files_changed,
                allow_lockfile_changes: self.allow_lockfile_changes,
            },
            collect_evidence: self.collect_finetuning_data,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Wire up a run and drive it to completion. Returns the process exit code.
pub async fn run(cli: Cli) -> i32 {
    let settings = match Settings::load() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{} {}", "config error:".red(), e);
            return 2;
        }
    };
    if let Err(e) = crate::infrastructure::logging::init(&settings) {
        eprintln!("warning: {}", e);
    }

    let config = match cli.into_run_config(&settings) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{} {}", "config error:".red(), e);
            return 2;
        }
    };

    let api_key = match Settings::require_api_key(&config.model) {
        Ok(key) => key,
        Err(e) => {
            eprintln!("{} {}", "config error:".red(), e);
            return 2;
        }
    };

    let model: Arc<dyn ModelClient> = match HttpModelClient::new(HttpModelConfig::new(
        &default_base_url(&config.model),
        &api_key,
        &config.model,
    )) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("{} {}", "config error:".red(), e);
            return 2;
        }
    };

    match prepare_and_run(config, settings, model).await {
        Ok(outcome) => {
            let status = if outcome.ok { "DONE".green().bold() } else { "BAILOUT".red().bold() };
            println!(
                "{} cause={} steps={} sandbox={}{}",
                status,
                outcome.cause,
                outcome.steps_taken,
                outcome.sandbox_root.display(),
                outcome
                    .evidence_dir
                    .map(|d| format!(" evidence={}", d.display()))
                    .unwrap_or_default(),
            );
            if outcome.ok {
                0
            } else {
                1
            }
        }
        Err(e) => {
            eprintln!("{} {}", "startup error:".red(), e);
            2
        }
    }
}

/// Create the sandbox, clone and prepare the target, then hand off to the
/// controller.
async fn prepare_and_run(
    config: RunConfig,
    settings: Settings,
    model: Arc<dyn ModelClient>,
) -> anyhow::Result<crate::services::controller::RunOutcome> {
    let mut sandbox = Sandbox::create(settings.sandbox_base.as_deref())?;
    let log = Arc::new(EventLog::create(&sandbox.log_path())?);
    log.append(
        "init",
        0,
        serde_json::json!({"repo": &config.repo_url, "mode": config.mode.as_str(), "model": &config.model}),
    );

    log.append("url_validation", 0, serde_json::json!({"normalized_url": &config.repo_url}));

    sandbox.clone_repo(&config.repo_url).await?;
    if let Some(git_ref) = &config.git_ref {
        sandbox.checkout(git_ref).await?;
    }
    sandbox.reset_hard().await?;

    let language = detect_language(&sandbox.repo_dir);
    sandbox.set_allowlist(effective_allowlist(language));
    log.append(
        "detect",
        0,
        serde_json::json!({"language": language.as_str()}),
    );
    info!(language = language.as_str(), sandbox = %sandbox.root.display(), "target prepared");

    let controller = Controller::new(
        sandbox,
        log,
        model,
        config,
        language,
        settings.results_dir.clone(),
    );
    Ok(controller.run().await)
}
