//! Candidate patches proposed by the model.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Evaluation lifecycle of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Pending,
    Pass,
    Fail,
    HygieneRejected,
}

/// A unified diff sampled at a specific temperature, awaiting evaluation
/// in an isolated worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchCandidate {
    pub temperature: f32,
    /// Position of the temperature in the configured list; lower wins
    /// tie-breaks under simultaneous completion.
    pub temp_index: usize,
    pub diff: String,
    /// SHA-256 of the diff text, used for dedup and event correlation.
    pub hash: String,
    pub status: CandidateStatus,
}

impl PatchCandidate {
    pub fn new(diff: String, temperature: f32, temp_index: usize) -> Self {
        let hash = diff_hash(&diff);
        Self {
            temperature,
            temp_index,
            diff,
            hash,
            status: CandidateStatus::Pending,
        }
    }
}

/// SHA-256 hex digest of a diff.
pub fn diff_hash(diff: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(diff.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable() {
        let diff = "--- a/x.py\n+++ b/x.py\n@@ -1 +1 @@\n-a\n+b\n";
        assert_eq!(diff_hash(diff), diff_hash(diff));
        assert_eq!(diff_hash(diff).len(), 64);
    }

    #[test]
    fn different_diffs_hash_differently() {
        assert_ne!(diff_hash("a"), diff_hash("b"));
    }

    #[test]
    fn new_candidate_is_pending() {
        let c = PatchCandidate::new("--- a/x\n+++ b/x\n".into(), 0.2, 1);
        assert_eq!(c.status, CandidateStatus::Pending);
        assert_eq!(c.temp_index, 1);
        assert_eq!(c.hash, diff_hash(&c.diff));
    }
}
