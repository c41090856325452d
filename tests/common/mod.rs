//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::process::Command;
use std::sync::Mutex;

use async_trait::async_trait;
use rfsn::domain::error::ModelError;
use rfsn::infrastructure::llm::ModelClient;
use rfsn::infrastructure::sandbox::Sandbox;
use rfsn::services::allowlist::effective_allowlist;
use rfsn::services::project_detector::ProjectLanguage;

/// A model client that replays a scripted sequence of raw replies. When the
/// script runs out the last reply repeats, which keeps temperature sampling
/// deterministic.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<String>) -> Self {
        let last = replies.last().cloned().unwrap_or_default();
        Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(last),
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, _prompt: &str, _temperature: f32) -> Result<String, ModelError> {
        let mut replies = self.replies.lock().unwrap();
        match replies.pop_front() {
            Some(reply) => {
                *self.last.lock().unwrap() = reply.clone();
                Ok(reply)
            }
            None => Ok(self.last.lock().unwrap().clone()),
        }
    }

    fn model_id(&self) -> &str {
        "scripted-test-model"
    }
}

/// A git repository whose "test suite" is `grep -q marker data.txt`:
/// failing until a patch adds the marker line. Keeps end-to-end runs
/// hermetic.
pub fn git_fixture(base: &std::path::Path) -> Sandbox {
    let mut sandbox = Sandbox::create(Some(base)).unwrap();
    std::fs::create_dir_all(&sandbox.repo_dir).unwrap();
    std::fs::write(sandbox.repo_dir.join("data.txt"), "plain line\n").unwrap();

    for args in [
        vec!["init", "-q"],
        vec!["config", "user.email", "ci@example.com"],
        vec!["config", "user.name", "ci"],
        vec!["add", "."],
        vec!["commit", "-qm", "seed"],
    ] {
        let status = Command::new("git")
            .args(&args)
            .current_dir(&sandbox.repo_dir)
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    sandbox.set_allowlist(effective_allowlist(ProjectLanguage::Unknown));
    sandbox
}

pub const FIX_DIFF: &str =
    "--- a/data.txt\n+++ b/data.txt\n@@ -1 +1,2 @@\n plain line\n+marker\n";

pub fn patch_reply(diff: &str) -> String {
    serde_json::json!({"mode": "patch", "diff": diff, "why": "add the marker"}).to_string()
}
