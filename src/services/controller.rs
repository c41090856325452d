//! The controller loop.
//!
//! A single-threaded, turn-based state machine: measure, consult the model,
//! mediate its tool use, evaluate candidate patches in parallel worktrees,
//! and apply a winner only after isolated verification. Nothing is declared
//! successful without an empirical `FINAL_VERIFY` pass.
//!
//! The loop perimeter in [`Controller::run`] is the only catch-all in the
//! crate; everything inside treats failure as a value.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use regex::Regex;
use serde_json::json;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::domain::error::BailoutCause;
use crate::domain::models::{
    CandidateStatus, CompletionStatus, LoopState, ModelReply, Observation, ObservationBuffer,
    PatchCandidate, Phase, PhaseTransition, Predicate, RunConfig, RunMode, ToolRequest,
    ValidatedReply, VerifyPolicy, VerifyResult,
};
use crate::infrastructure::event_log::EventLog;
use crate::infrastructure::llm::ModelClient;
use crate::infrastructure::sandbox::Sandbox;
use crate::services::evaluator;
use crate::services::evidence::{self, EvidenceInputs};
use crate::services::hygiene::{self, HygieneConfig};
use crate::services::policy::{self, Intent, PolicyDecision};
use crate::services::project_detector::ProjectLanguage;
use crate::services::prompt::{build_prompt, PromptState};
use crate::services::tool_manager::{ToolDecision, ToolManager, ToolQuota};
use crate::services::validator;
use crate::services::verifier;

/// Model turns allowed within one step before the loop re-measures.
const MAX_MODEL_TURNS_PER_STEP: u32 = 3;

const READ_FILE_CAP: usize = 120_000;
const TRACE_FILE_LIMIT: usize = 6;

fn trace_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"File "([^"]+\.py)""#).expect("static regex"))
}

/// Candidate construction with run-wide diff dedup: a hash already seen is
/// never evaluated twice.
fn dedup_candidate(
    diff: String,
    temperature: f32,
    temp_index: usize,
    seen: &mut HashSet<String>,
) -> Option<PatchCandidate> {
    let candidate = PatchCandidate::new(diff, temperature, temp_index);
    if seen.insert(candidate.hash.clone()) {
        Some(candidate)
    } else {
        None
    }
}

/// Final outcome of a run.
#[derive(Debug)]
pub struct RunOutcome {
    pub ok: bool,
    pub cause: String,
    pub steps_taken: u64,
    pub sandbox_root: PathBuf,
    pub evidence_dir: Option<PathBuf>,
}

/// The verification-grounded repair/feature loop.
pub struct Controller {
    sandbox: Sandbox,
    log: Arc<EventLog>,
    model: Arc<dyn ModelClient>,
    config: RunConfig,
    test_cmd: String,
    hygiene_config: HygieneConfig,
    tool_manager: ToolManager,
    state: LoopState,
    observations: ObservationBuffer,
    seen_diff_hashes: HashSet<String>,
    repo_tree_text: String,
    evidence: EvidenceInputs,
    results_dir: PathBuf,
    phase: Phase,
}

impl Controller {
    /// Assemble a controller over an already-cloned sandbox.
    pub fn new(
        sandbox: Sandbox,
        log: Arc<EventLog>,
        model: Arc<dyn ModelClient>,
        config: RunConfig,
        language: ProjectLanguage,
        results_dir: PathBuf,
    ) -> Self {
        let test_cmd = config
            .test_cmd
            .clone()
            .unwrap_or_else(|| language.default_test_cmd().to_string());
        let hygiene_config = HygieneConfig::for_run(config.mode, language, &config.hygiene);
        let repo_tree_text = sandbox.list_tree(2000).join("\n");

        Self {
            sandbox,
            log,
            model,
            config,
            test_cmd,
            hygiene_config,
            tool_manager: ToolManager::new(ToolQuota::default()),
            state: LoopState::new(),
            observations: ObservationBuffer::new(),
            seen_diff_hashes: HashSet::new(),
            repo_tree_text,
            evidence: EvidenceInputs::default(),
            results_dir,
            phase: Phase::Measure,
        }
    }

    /// Drive the loop to a terminal phase. This is the only place an
    /// unexpected error is caught; it becomes a bailout with a best-effort
    /// evidence pack, never a crash.
    pub async fn run(mut self) -> RunOutcome {
        match self.run_inner().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "unexpected exception reached the loop perimeter");
                let cause = BailoutCause::UnexpectedException(e.to_string());
                self.transition(Phase::Bailout, cause.as_str());
                self.log.append(
                    "bailout",
                    self.state.step,
                    json!({"cause": cause.as_str(), "error": e.to_string()}),
                );
                let evidence_dir = self.try_export_evidence();
                RunOutcome {
                    ok: false,
                    cause: cause.as_str().to_string(),
                    steps_taken: self.state.step,
                    sandbox_root: self.sandbox.root.clone(),
                    evidence_dir,
                }
            }
        }
    }

    async fn run_inner(&mut self) -> Result<RunOutcome> {
        loop {
            if let Some(max) = self.config.max_steps {
                if self.state.step >= max {
                    return Ok(self.bailout(BailoutCause::MaxStepsReached));
                }
            }

            // === MEASURE ===
            self.transition(Phase::Measure, "");
            let verify = self.measure().await;
            if self.state.step == 0 {
                self.evidence.baseline_output = verify.combined_output();
                self.evidence.failing_tests_before = verify.failing_tests.len();
            }
            self.evidence.final_output = verify.combined_output();
            self.evidence.failing_tests_after = verify.failing_tests.len();

            let assessment = self.state.observe_measure(
                &verify.fingerprint,
                verify.failing_tests.len(),
                verify.skipped,
            );

            self.log.append(
                "measure",
                self.state.step,
                json!({
                    "tests_ok": verify.ok,
                    "exit_code": verify.exit_code,
                    "failing_tests": &verify.failing_tests,
                    "fingerprint": &verify.fingerprint,
                    "skipped": verify.skipped,
                }),
            );
            self.progress_line(&verify);

            if assessment.multi_bug {
                self.log.append(
                    "measure",
                    self.state.step,
                    json!({"note": "multi_bug", "distinct_signatures": self.state.distinct_signature_count()}),
                );
            }

            if self.config.mode == RunMode::Repair && verify.ok {
                if let Some(outcome) = self.final_verify().await? {
                    return Ok(outcome);
                }
                self.state.step += 1;
                continue;
            }

            if assessment.stalled {
                self.log.append(
                    "stall_detected",
                    self.state.step,
                    json!({"fingerprint": &verify.fingerprint, "patch_attempts": self.state.patch_attempts}),
                );
            }

            if self.state.steps_without_progress >= self.config.max_steps_without_progress {
                return Ok(self.bailout(BailoutCause::NoProgress));
            }

            // === MODEL (bounded turns, tools feed back in) ===
            let mut decision = policy::choose_policy(&self.test_cmd, &verify);
            if assessment.stalled {
                decision.intent = Intent::GatherEvidence;
                decision.subgoal = Intent::GatherEvidence.subgoal().to_string();
            }

            let mut turns = 0;
            loop {
                turns += 1;
                self.transition(Phase::Model, "");
                let validated = self.consult_model(&verify, &decision).await?;
                self.log.append(
                    "model",
                    self.state.step,
                    json!({
                        "mode": validated.reply.mode(),
                        "fallback": validated.is_fallback(),
                        "rejected_requests": &validated.rejected_requests,
                    }),
                );

                match validated.reply {
                    ModelReply::ToolRequests { ref requests, .. } => {
                        self.apply_tools(requests.clone(), &validated).await;
                        // A malformed reply consumes the step; so does quota
                        // exhaustion or the turn budget.
                        if validated.is_fallback()
                            || self.tool_manager.exhausted()
                            || turns >= MAX_MODEL_TURNS_PER_STEP
                        {
                            break;
                        }
                    }
                    ModelReply::Patch { ref diff, .. } => {
                        if let Some(outcome) =
                            self.generate_and_evaluate(diff.clone(), &verify, &decision).await?
                        {
                            return Ok(outcome);
                        }
                        break;
                    }
                    ModelReply::FeatureSummary { ref summary, status } => {
                        self.log.append(
                            "model",
                            self.state.step,
                            json!({"summary": summary, "completion_status": status.as_str()}),
                        );
                        if status == CompletionStatus::Complete {
                            if let Some(outcome) = self.final_verify().await? {
                                return Ok(outcome);
                            }
                        } else {
                            self.observations.push(&Observation::note(
                                "feature_summary",
                                &format!("status {}: {}", status.as_str(), summary),
                            ));
                        }
                        break;
                    }
                }
            }

            self.state.step += 1;
        }
    }

    /// Run the measurement predicate for the current mode. Feature mode
    /// tolerates "no tests collected" until `FINAL_VERIFY`.
    async fn measure(&self) -> VerifyResult {
        let allow_skip = self.config.mode == RunMode::Feature;
        verifier::run_verify(
            &self.sandbox,
            &self.test_cmd,
            Predicate::Tests,
            verifier::FULL_TIMEOUT,
            allow_skip,
        )
        .await
    }

    async fn consult_model(
        &self,
        verify: &VerifyResult,
        decision: &PolicyDecision,
    ) -> Result<ValidatedReply> {
        let files_block = self.collect_relevant_files(verify);
        let observations = self.observations.as_text();
        let state = PromptState {
            config: &self.config,
            verify,
            decision,
            test_cmd: &self.test_cmd,
            repo_tree: &self.repo_tree_text,
            files_block: &files_block,
            observations: &observations,
        };
        let prompt = build_prompt(&state);
        let raw = self
            .model
            .complete(&prompt, *self.config.temperatures.first().unwrap_or(&0.0))
            .await?;
        Ok(validator::validate_model_output(&raw, self.config.mode))
    }

    /// Execute a batch of tool requests through the mediator. Every request
    /// produces exactly one observation, in dispatch order.
    async fn apply_tools(&mut self, requests: Vec<ToolRequest>, validated: &ValidatedReply) {
        self.transition(Phase::ApplyTools, "");

        if let Some(corrective) = &validated.corrective {
            self.observations.push(&Observation::note("validator", corrective));
        }
        for rejection in &validated.rejected_requests {
            self.observations.push(&Observation::note("validator", rejection));
        }
        // Rejected requests never ran but still count against the budget
        self.tool_manager.charge(validated.rejected_requests.len());

        let decisions = self.tool_manager.filter(requests);
        let mut executed = 0usize;
        for (request, decision) in decisions {
            let observation = match decision {
                ToolDecision::Allow => {
                    executed += 1;
                    self.execute_tool(&request).await
                }
                ToolDecision::Duplicate => Observation::note(
                    &request.tool,
                    "duplicate_request: identical request already executed this run",
                ),
                ToolDecision::QuotaExceeded => Observation::note(
                    &request.tool,
                    "quota_exceeded: tool request budget spent, propose a patch instead",
                ),
            };
            self.evidence.command_log.push(json!({
                "tool": &request.tool,
                "args": &request.args,
                "decision": decision.as_str(),
            }));
            self.observations.push(&observation);
        }

        self.evidence.tool_requests_used = self.tool_manager.used();
        self.log.append(
            "tools_executed",
            self.state.step,
            json!({"executed": executed, "quota_used": self.tool_manager.used()}),
        );
    }

    /// Dispatch one allowlisted tool against the sandbox.
    async fn execute_tool(&self, request: &ToolRequest) -> Observation {
        let args = &request.args;
        match request.tool.as_str() {
            "sandbox.list_tree" => {
                let max = args.get("max_files").and_then(|v| v.as_u64()).unwrap_or(2000) as usize;
                let files = self.sandbox.list_tree(max);
                Observation::new(
                    &request.tool,
                    request.args_digest(),
                    Some(0),
                    &format!("{} files\n{}", files.len(), files.join("\n")),
                )
            }
            "sandbox.read_file" => {
                let path = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
                let max = args.get("max_bytes").and_then(|v| v.as_u64()).unwrap_or(READ_FILE_CAP as u64)
                    as usize;
                match self.sandbox.read_file(path, max) {
                    Ok(text) => {
                        Observation::new(&request.tool, request.args_digest(), Some(0), &text)
                    }
                    Err(e) => Observation::note(&request.tool, &e.to_string()),
                }
            }
            "sandbox.grep" => {
                let query = args
                    .get("query")
                    .or_else(|| args.get("pattern"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let max = args.get("max_matches").and_then(|v| v.as_u64()).unwrap_or(200) as usize;
                match self.sandbox.grep(query, max).await {
                    Ok(matches) => Observation::new(
                        &request.tool,
                        request.args_digest(),
                        Some(0),
                        &format!("{} matches\n{}", matches.len(), matches.join("\n")),
                    ),
                    Err(e) => Observation::note(&request.tool, &e.to_string()),
                }
            }
            "sandbox.run" => {
                let cmd = args.get("cmd").and_then(|v| v.as_str()).unwrap_or("");
                // Dependency installs get a longer leash than ordinary commands
                let timeout = if cmd.contains("install") {
                    std::time::Duration::from_secs(300)
                } else {
                    verifier::FOCUS_TIMEOUT
                };
                match crate::services::command_guard::normalize_command(cmd) {
                    Ok(argv) => match self.sandbox.run(&argv, timeout).await {
                        Ok(result) => Observation::new(
                            &request.tool,
                            request.args_digest(),
                            Some(result.exit_code),
                            &format!("{}{}", result.stdout, result.stderr),
                        ),
                        Err(e) => Observation::note(&request.tool, &e.to_string()),
                    },
                    Err(e) => Observation::note(&request.tool, &e.to_string()),
                }
            }
            other => Observation::note(other, "unknown tool"),
        }
    }

    /// GENERATE_PATCHES → EVALUATE → APPLY_WINNER.
    ///
    /// The triggering diff is the first candidate; the remaining
    /// temperatures are sampled for diversity. Survivors of the hygiene
    /// gate race in isolated worktrees.
    async fn generate_and_evaluate(
        &mut self,
        first_diff: String,
        verify: &VerifyResult,
        decision: &PolicyDecision,
    ) -> Result<Option<RunOutcome>> {
        self.transition(Phase::GeneratePatches, "");

        let mut candidates: Vec<PatchCandidate> = Vec::new();

        if let Some(c) = dedup_candidate(
            first_diff,
            self.config.temperatures[0],
            0,
            &mut self.seen_diff_hashes,
        ) {
            candidates.push(c);
        }

        // Sample the remaining temperatures
        let files_block = self.collect_relevant_files(verify);
        let observations = self.observations.as_text();
        let state = PromptState {
            config: &self.config,
            verify,
            decision,
            test_cmd: &self.test_cmd,
            repo_tree: &self.repo_tree_text,
            files_block: &files_block,
            observations: &observations,
        };
        let prompt = build_prompt(&state);
        for (index, &temp) in self.config.temperatures.iter().enumerate().skip(1) {
            let raw = match self.model.complete(&prompt, temp).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(temperature = temp, error = %e, "sample failed, continuing without it");
                    continue;
                }
            };
            let validated = validator::validate_model_output(&raw, self.config.mode);
            if let ModelReply::Patch { diff, .. } = validated.reply {
                if let Some(c) = dedup_candidate(diff, temp, index, &mut self.seen_diff_hashes) {
                    candidates.push(c);
                }
            }
        }

        // Hygiene gate; every verdict is logged before any evaluation
        let mut survivors = Vec::new();
        for mut candidate in candidates {
            let verdict = hygiene::validate_patch(&candidate.diff, &self.hygiene_config);
            self.log.append(
                "patch_hygiene",
                self.state.step,
                json!({
                    "diff_hash": &candidate.hash,
                    "temperature": candidate.temperature,
                    "accepted": verdict.is_accepted(),
                    "violations": verdict.violations(),
                }),
            );
            if verdict.is_accepted() {
                survivors.push(candidate);
            } else {
                candidate.status = CandidateStatus::HygieneRejected;
                self.observations.push(&Observation::note(
                    "patch_hygiene",
                    &format!("hygiene_rejected: {}", verdict.violations().join("; ")),
                ));
            }
        }

        if survivors.is_empty() {
            self.state.record_patch_attempt();
            return Ok(None);
        }

        self.transition(Phase::Evaluate, "");
        let focus_cmd = decision.focus_cmd.clone();
        let outcome = evaluator::evaluate_candidates(
            &self.sandbox,
            survivors,
            focus_cmd,
            self.test_cmd.clone(),
            verifier::FULL_TIMEOUT,
        )
        .await;

        for report in &outcome.reports {
            self.log.append(
                "candidate_eval",
                self.state.step,
                json!({
                    "diff_hash": &report.candidate.hash,
                    "temperature": report.candidate.temperature,
                    "ok": report.verify.ok,
                    "failing_tests": report.verify.failing_tests.len(),
                }),
            );
        }

        let Some(winner) = outcome.winner else {
            if let Some(loser) = outcome.best_loser() {
                self.observations.push(&Observation::note(
                    "candidate_eval",
                    &format!(
                        "no candidate passed; best failed with {} failing tests",
                        loser.verify.failing_tests.len()
                    ),
                ));
            }
            self.state.record_patch_attempt();
            return Ok(None);
        };

        self.transition(Phase::ApplyWinner, "");
        self.sandbox
            .apply_patch(&winner.candidate.diff)
            .await
            .map_err(|e| anyhow::anyhow!("winner failed to apply to primary copy: {}", e))?;
        self.evidence.winner_diff = Some(winner.candidate.diff.clone());
        self.log.append(
            "apply_winner",
            self.state.step,
            json!({
                "diff_hash": &winner.candidate.hash,
                "temperature": winner.candidate.temperature,
            }),
        );
        info!(hash = %winner.candidate.hash, "winner applied to primary working copy");

        // Next step re-measures; DONE only ever follows a FINAL_VERIFY pass.
        Ok(None)
    }

    /// The full verification contract. `Some(outcome)` means terminal
    /// success; `None` sends the loop back to MODEL with the rejection on
    /// record.
    async fn final_verify(&mut self) -> Result<Option<RunOutcome>> {
        self.transition(Phase::FinalVerify, "");

        let mut all_ok = true;
        let mut failed_cmd = String::new();

        let commands: Vec<(&str, Predicate)> = self
            .config
            .focused_verify_cmds
            .iter()
            .chain(self.config.extra_verify_cmds.iter())
            .map(|c| (c.as_str(), Predicate::Command))
            .collect();

        for (cmd, predicate) in commands {
            let result = verifier::run_verify(
                &self.sandbox,
                cmd,
                predicate,
                verifier::FOCUS_TIMEOUT,
                false,
            )
            .await;
            self.log.append(
                "final_verify",
                self.state.step,
                json!({"cmd": cmd, "ok": result.ok, "exit_code": result.exit_code}),
            );
            if !result.ok {
                all_ok = false;
                failed_cmd = cmd.to_string();
                break;
            }
        }

        if all_ok && self.config.verify_policy != VerifyPolicy::CmdsOnly {
            let result = verifier::run_verify(
                &self.sandbox,
                &self.test_cmd,
                Predicate::Tests,
                verifier::FULL_TIMEOUT,
                false,
            )
            .await;
            self.log.append(
                "final_verify",
                self.state.step,
                json!({
                    "cmd": &self.test_cmd,
                    "ok": result.ok,
                    "exit_code": result.exit_code,
                    "failing_tests": &result.failing_tests,
                }),
            );
            if result.ok {
                self.evidence.final_output = result.combined_output();
                self.evidence.failing_tests_after = 0;
            } else {
                all_ok = false;
                failed_cmd = self.test_cmd.clone();
            }
        }

        if !all_ok {
            self.log.append(
                "verification_failed",
                self.state.step,
                json!({"cmd": failed_cmd}),
            );
            if self.config.mode == RunMode::Feature {
                self.observations.push(&Observation::note(
                    "final_verify",
                    &format!(
                        "COMPLETION REJECTED: verification command failed: {}",
                        failed_cmd
                    ),
                ));
            }
            return Ok(None);
        }

        self.transition(Phase::Done, "");
        self.evidence.steps_taken = self.state.step;
        let evidence_dir = self.try_export_evidence();
        self.log.append("done", self.state.step, json!({"steps_taken": self.state.step}));
        Ok(Some(RunOutcome {
            ok: true,
            cause: "done".to_string(),
            steps_taken: self.state.step,
            sandbox_root: self.sandbox.root.clone(),
            evidence_dir,
        }))
    }

    fn bailout(&mut self, cause: BailoutCause) -> RunOutcome {
        self.transition(Phase::Bailout, cause.as_str());
        self.log.append(
            "bailout",
            self.state.step,
            json!({"cause": cause.as_str()}),
        );
        let evidence_dir =
            if self.config.collect_evidence { self.try_export_evidence() } else { None };
        RunOutcome {
            ok: false,
            cause: cause.as_str().to_string(),
            steps_taken: self.state.step,
            sandbox_root: self.sandbox.root.clone(),
            evidence_dir,
        }
    }

    fn try_export_evidence(&mut self) -> Option<PathBuf> {
        self.evidence.steps_taken = self.state.step;
        self.evidence.tool_requests_used = self.tool_manager.used();
        match evidence::export_pack(
            &self.results_dir,
            &self.sandbox.run_id,
            &self.config,
            &self.evidence,
        ) {
            Ok(dir) => {
                self.log.append(
                    "finetuning_data",
                    self.state.step,
                    json!({"dir": dir.display().to_string(), "has_winner": self.evidence.winner_diff.is_some()}),
                );
                Some(dir)
            }
            Err(e) => {
                warn!(error = %e, "evidence export failed");
                None
            }
        }
    }

    /// Collect the first failing test file and traceback-referenced files
    /// for the prompt, filtered through the sandbox path rules.
    fn collect_relevant_files(&self, verify: &VerifyResult) -> String {
        let mut blocks = Vec::new();
        let mut seen = HashSet::new();

        if let Some(test_file) = verifier::failing_test_file(&verify.failing_tests) {
            if let Ok(text) = self.sandbox.read_file(&test_file, READ_FILE_CAP) {
                seen.insert(test_file.clone());
                blocks.push(format!("[path: {}]\n{}", test_file, text));
            }
        }

        let combined = verify.combined_output();
        for capture in trace_file_re().captures_iter(&combined).take(TRACE_FILE_LIMIT) {
            let mut path = capture[1].replace('\\', "/");
            let repo_prefix = self.sandbox.repo_dir.to_string_lossy().replace('\\', "/");
            if let Some(stripped) = path.strip_prefix(&repo_prefix) {
                path = stripped.trim_start_matches('/').to_string();
            }
            if seen.contains(&path) {
                continue;
            }
            if let Ok(text) = self.sandbox.read_file(&path, READ_FILE_CAP) {
                seen.insert(path.clone());
                blocks.push(format!("[path: {}]\n{}", path, text));
            }
        }

        blocks.join("\n")
    }

    fn transition(&mut self, to: Phase, reason: &str) {
        let transition = PhaseTransition::with_reason(Some(self.phase), to, reason);
        self.phase = to;
        self.log.append(
            "phase_transition",
            self.state.step,
            serde_json::to_value(&transition).unwrap_or_default(),
        );
    }

    fn progress_line(&self, verify: &VerifyResult) {
        info!(
            step = self.state.step,
            tests_ok = verify.ok,
            failing = verify.failing_tests.len(),
            skipped = verify.skipped,
            "measure"
        );
    }
}
