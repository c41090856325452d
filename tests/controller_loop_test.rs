//! End-to-end controller loop tests against a real git fixture and a
//! scripted model.

mod common;

use std::sync::Arc;

use rfsn::domain::models::{RunConfig, RunMode};
use rfsn::infrastructure::event_log::EventLog;
use rfsn::services::controller::Controller;
use rfsn::services::project_detector::ProjectLanguage;

use common::{git_fixture, patch_reply, ScriptedModel, FIX_DIFF};

fn run_config(test_cmd: &str, max_steps: u64) -> RunConfig {
    RunConfig {
        repo_url: "https://github.com/example/fixture".into(),
        test_cmd: Some(test_cmd.into()),
        max_steps: Some(max_steps),
        collect_evidence: true,
        ..Default::default()
    }
}

fn log_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[tokio::test]
async fn one_shot_repair_reaches_done() {
    let base = tempfile::tempdir().unwrap();
    let results = tempfile::tempdir().unwrap();
    let sandbox = git_fixture(base.path());
    let log_path = sandbox.log_path();
    let log = Arc::new(EventLog::create(&log_path).unwrap());

    // Every model turn proposes the fixing patch; samples at higher
    // temperatures dedupe against the first candidate.
    let model = Arc::new(ScriptedModel::new(vec![patch_reply(FIX_DIFF)]));

    let controller = Controller::new(
        sandbox,
        log,
        model,
        run_config("grep -q marker data.txt", 12),
        ProjectLanguage::Unknown,
        results.path().to_path_buf(),
    );
    let outcome = controller.run().await;

    assert!(outcome.ok, "expected DONE, got cause {}", outcome.cause);
    assert_eq!(outcome.cause, "done");
    assert_eq!(outcome.steps_taken, 1);

    // The evidence pack carries the winning diff
    let evidence_dir = outcome.evidence_dir.expect("evidence pack expected on DONE");
    let winner = std::fs::read_to_string(evidence_dir.join("winner.diff")).unwrap();
    assert_eq!(winner, FIX_DIFF);

    // Event-log invariants: hygiene precedes candidate_eval for the hash,
    // candidate_eval{ok} precedes apply_winner, a measure follows the apply
    let events = log_lines(&log_path);
    let index_of = |phase: &str| events.iter().position(|e| e["phase"] == phase);
    let hygiene = index_of("patch_hygiene").expect("hygiene event");
    let eval = index_of("candidate_eval").expect("candidate_eval event");
    let apply = index_of("apply_winner").expect("apply_winner event");
    let done = index_of("done").expect("done event");
    assert!(hygiene < eval);
    assert!(eval < apply);
    assert!(apply < done);

    let eval_event = &events[eval];
    let apply_event = &events[apply];
    assert_eq!(eval_event["ok"], true);
    assert_eq!(eval_event["diff_hash"], apply_event["diff_hash"]);

    // FINAL_VERIFY ran after the winner was applied
    let final_verify = index_of("final_verify").expect("final_verify event");
    assert!(apply < final_verify && final_verify < done);
}

#[tokio::test]
async fn hygiene_rejected_patch_never_reaches_evaluation() {
    let base = tempfile::tempdir().unwrap();
    let results = tempfile::tempdir().unwrap();
    let sandbox = git_fixture(base.path());
    let log_path = sandbox.log_path();
    let log = Arc::new(EventLog::create(&log_path).unwrap());

    // The proposed diff touches a forbidden path
    let bad_diff = "--- a/.git/config\n+++ b/.git/config\n@@ -1 +1 @@\n-x\n+y\n";
    let model = Arc::new(ScriptedModel::new(vec![patch_reply(bad_diff)]));

    let controller = Controller::new(
        sandbox,
        log,
        model,
        run_config("grep -q marker data.txt", 2),
        ProjectLanguage::Unknown,
        results.path().to_path_buf(),
    );
    let outcome = controller.run().await;

    assert!(!outcome.ok);
    let events = log_lines(&log_path);
    assert!(events.iter().any(|e| e["phase"] == "patch_hygiene" && e["accepted"] == false));
    assert!(!events.iter().any(|e| e["phase"] == "candidate_eval"));
    assert!(!events.iter().any(|e| e["phase"] == "apply_winner"));
}

#[tokio::test]
async fn malformed_replies_stall_and_bail_out() {
    let base = tempfile::tempdir().unwrap();
    let results = tempfile::tempdir().unwrap();
    let sandbox = git_fixture(base.path());
    let log_path = sandbox.log_path();
    let log = Arc::new(EventLog::create(&log_path).unwrap());

    // The model never follows the contract
    let model = Arc::new(ScriptedModel::new(vec!["the bug is in data.txt".to_string()]));

    let controller = Controller::new(
        sandbox,
        log,
        model,
        run_config("grep -q marker data.txt", 5),
        ProjectLanguage::Unknown,
        results.path().to_path_buf(),
    );
    let outcome = controller.run().await;

    assert!(!outcome.ok);
    assert_eq!(outcome.cause, "max_steps_reached");
    assert_eq!(outcome.steps_taken, 5);

    let events = log_lines(&log_path);
    // The same fingerprint repeated every step: stall must be detected
    assert!(events.iter().any(|e| e["phase"] == "stall_detected"));
    // Fallback replies were logged as such
    assert!(events.iter().any(|e| e["phase"] == "model" && e["fallback"] == true));
    // And the run ended with a bailout record
    assert!(events.iter().any(|e| e["phase"] == "bailout"
        && e["cause"] == "max_steps_reached"));
}

#[tokio::test]
async fn shell_idiom_tool_request_is_rejected_without_execution() {
    let base = tempfile::tempdir().unwrap();
    let results = tempfile::tempdir().unwrap();
    let sandbox = git_fixture(base.path());
    let log_path = sandbox.log_path();
    let log = Arc::new(EventLog::create(&log_path).unwrap());

    let chained = serde_json::json!({
        "mode": "tool_request",
        "requests": [
            {"tool": "sandbox.run", "args": {"cmd": "grep marker data.txt && echo found"}},
            {"tool": "sandbox.read_file", "args": {"path": "data.txt"}}
        ],
        "why": "inspect"
    })
    .to_string();
    let model = Arc::new(ScriptedModel::new(vec![chained]));

    let controller = Controller::new(
        sandbox,
        log,
        model,
        run_config("grep -q marker data.txt", 2),
        ProjectLanguage::Unknown,
        results.path().to_path_buf(),
    );
    let outcome = controller.run().await;
    assert!(!outcome.ok);

    let events = log_lines(&log_path);
    // The chained command was dropped at validation; the clean read_file
    // request still executed
    let model_events: Vec<_> =
        events.iter().filter(|e| e["phase"] == "model" && e["mode"] == "tool_request").collect();
    assert!(!model_events.is_empty());
    assert!(model_events[0]["rejected_requests"][0]
        .as_str()
        .unwrap()
        .contains("Shell syntax"));
    assert!(events.iter().any(|e| e["phase"] == "tools_executed" && e["executed"] == 1));
}

#[tokio::test]
async fn feature_completion_is_gated_by_final_verify() {
    let base = tempfile::tempdir().unwrap();
    let results = tempfile::tempdir().unwrap();
    let sandbox = git_fixture(base.path());
    let log_path = sandbox.log_path();
    let log = Arc::new(EventLog::create(&log_path).unwrap());

    // The model claims completion immediately, but the verify command fails
    let summary = serde_json::json!({
        "mode": "feature_summary",
        "summary": "Implemented the marker feature end to end",
        "completion_status": "complete"
    })
    .to_string();
    let model = Arc::new(ScriptedModel::new(vec![summary]));

    let config = RunConfig {
        repo_url: "https://github.com/example/fixture".into(),
        mode: RunMode::Feature,
        feature_description: Some("add a marker line".into()),
        test_cmd: Some("grep -q marker data.txt".into()),
        max_steps: Some(3),
        ..Default::default()
    };

    let controller = Controller::new(
        sandbox,
        log,
        model,
        config,
        ProjectLanguage::Unknown,
        results.path().to_path_buf(),
    );
    let outcome = controller.run().await;

    // Completion claims without passing verification never reach DONE
    assert!(!outcome.ok);
    let events = log_lines(&log_path);
    assert!(events.iter().any(|e| e["phase"] == "verification_failed"));
    assert!(!events.iter().any(|e| e["phase"] == "done"));
}
