//! Tool request deduplication and quota enforcement.
//!
//! The model pays for every request it makes, including duplicates: a
//! dropped duplicate still consumes quota so repeating the same request is
//! never free.

use std::collections::HashSet;

use crate::domain::models::ToolRequest;

/// Quota limits for one run.
#[derive(Debug, Clone)]
pub struct ToolQuota {
    pub max_per_response: usize,
    pub max_per_run: usize,
}

impl Default for ToolQuota {
    fn default() -> Self {
        Self { max_per_response: 6, max_per_run: 20 }
    }
}

/// What the mediator decided about one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolDecision {
    /// Execute the request.
    Allow,
    /// Signature already seen this run; dropped, quota still charged.
    Duplicate,
    /// Per-response or per-run cap hit; dropped without charge.
    QuotaExceeded,
}

impl ToolDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Duplicate => "duplicate_request",
            Self::QuotaExceeded => "quota_exceeded",
        }
    }
}

/// Per-run mediator between the model and the sandbox.
#[derive(Debug, Default)]
pub struct ToolManager {
    quota: ToolQuota,
    seen_signatures: HashSet<String>,
    used_this_run: usize,
}

impl ToolManager {
    pub fn new(quota: ToolQuota) -> Self {
        Self { quota, seen_signatures: HashSet::new(), used_this_run: 0 }
    }

    /// Run one response's worth of requests through dedup and quotas.
    /// Decisions come back in request order.
    pub fn filter(&mut self, requests: Vec<ToolRequest>) -> Vec<(ToolRequest, ToolDecision)> {
        let mut out = Vec::with_capacity(requests.len());

        for (index, request) in requests.into_iter().enumerate() {
            if index >= self.quota.max_per_response {
                out.push((request, ToolDecision::QuotaExceeded));
                continue;
            }
            if self.used_this_run >= self.quota.max_per_run {
                out.push((request, ToolDecision::QuotaExceeded));
                continue;
            }

            let signature = request.signature();
            if self.seen_signatures.contains(&signature) {
                // Charged but not executed
                self.used_this_run += 1;
                out.push((request, ToolDecision::Duplicate));
                continue;
            }

            self.seen_signatures.insert(signature);
            self.used_this_run += 1;
            out.push((request, ToolDecision::Allow));
        }

        out
    }

    /// Charge quota for requests that were rejected before reaching the
    /// mediator (shell idioms, unknown tools). Rejections are never free.
    pub fn charge(&mut self, count: usize) {
        self.used_this_run = (self.used_this_run + count).min(self.quota.max_per_run);
    }

    /// True once the per-run budget is spent; the controller stops offering
    /// tools and pushes the model toward patches.
    pub fn exhausted(&self) -> bool {
        self.used_this_run >= self.quota.max_per_run
    }

    pub fn used(&self) -> usize {
        self.used_this_run
    }

    pub fn unique_signatures(&self) -> usize {
        self.seen_signatures.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req(tool: &str, path: &str) -> ToolRequest {
        ToolRequest {
            tool: tool.to_string(),
            args: json!({ "path": path }).as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn allows_fresh_requests() {
        let mut mgr = ToolManager::new(ToolQuota::default());
        let decisions = mgr.filter(vec![req("sandbox.read_file", "a.py")]);
        assert_eq!(decisions[0].1, ToolDecision::Allow);
        assert_eq!(mgr.used(), 1);
    }

    #[test]
    fn duplicates_dropped_but_charged() {
        let mut mgr = ToolManager::new(ToolQuota::default());
        let decisions = mgr.filter(vec![
            req("sandbox.read_file", "a.py"),
            req("sandbox.read_file", "a.py"),
        ]);
        assert_eq!(decisions[0].1, ToolDecision::Allow);
        assert_eq!(decisions[1].1, ToolDecision::Duplicate);
        // Both consumed quota
        assert_eq!(mgr.used(), 2);
        assert_eq!(mgr.unique_signatures(), 1);
    }

    #[test]
    fn dedup_spans_responses() {
        let mut mgr = ToolManager::new(ToolQuota::default());
        mgr.filter(vec![req("sandbox.read_file", "a.py")]);
        let decisions = mgr.filter(vec![req("sandbox.read_file", "a.py")]);
        assert_eq!(decisions[0].1, ToolDecision::Duplicate);
    }

    #[test]
    fn per_response_cap_drops_tail() {
        let mut mgr = ToolManager::new(ToolQuota::default());
        let requests: Vec<ToolRequest> =
            (0..8).map(|i| req("sandbox.read_file", &format!("f{}.py", i))).collect();
        let decisions = mgr.filter(requests);
        assert_eq!(decisions.len(), 8);
        assert!(decisions[..6].iter().all(|(_, d)| *d == ToolDecision::Allow));
        assert!(decisions[6..].iter().all(|(_, d)| *d == ToolDecision::QuotaExceeded));
        // Dropped requests are not charged
        assert_eq!(mgr.used(), 6);
    }

    #[test]
    fn per_run_cap_exhausts_manager() {
        let mut mgr = ToolManager::new(ToolQuota { max_per_response: 6, max_per_run: 8 });
        for batch in 0..2 {
            mgr.filter(
                (0..6)
                    .map(|i| req("sandbox.read_file", &format!("b{}f{}.py", batch, i)))
                    .collect(),
            );
        }
        assert!(mgr.exhausted());
        let decisions = mgr.filter(vec![req("sandbox.read_file", "late.py")]);
        assert_eq!(decisions[0].1, ToolDecision::QuotaExceeded);
    }

    #[test]
    fn rejected_requests_are_charged() {
        let mut mgr = ToolManager::new(ToolQuota { max_per_response: 6, max_per_run: 3 });
        mgr.charge(1);
        assert_eq!(mgr.used(), 1);
        mgr.charge(10);
        assert!(mgr.exhausted());
        let decisions = mgr.filter(vec![req("sandbox.read_file", "a.py")]);
        assert_eq!(decisions[0].1, ToolDecision::QuotaExceeded);
    }

    #[test]
    fn dedup_is_deterministic() {
        let mut a = ToolManager::new(ToolQuota::default());
        let mut b = ToolManager::new(ToolQuota::default());
        let batch = || {
            vec![
                req("sandbox.grep", "one"),
                req("sandbox.grep", "two"),
                req("sandbox.grep", "one"),
            ]
        };
        let da: Vec<ToolDecision> = a.filter(batch()).into_iter().map(|(_, d)| d).collect();
        let db: Vec<ToolDecision> = b.filter(batch()).into_iter().map(|(_, d)| d).collect();
        assert_eq!(da, db);
    }
}
