//! Append-only JSONL event log.
//!
//! One JSON object per line, every line carrying `phase`, `step`, and an
//! ISO-8601 `ts`. The log is loop-owned and is the source of truth for what
//! happened in a run.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};

/// Handle to the run's `run.jsonl`. Cloneable via Arc by the owner only;
/// workers report results as values instead of writing here.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl EventLog {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open event log at {}", path.display()))?;
        Ok(Self { path: path.to_path_buf(), file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. `fields` must be a JSON object; its entries are
    /// merged next to the standard keys.
    pub fn append(&self, phase: &str, step: u64, fields: Value) {
        let mut record = json!({
            "phase": phase,
            "step": step,
            "ts": Utc::now().to_rfc3339(),
        });
        if let (Some(base), Some(extra)) = (record.as_object_mut(), fields.as_object()) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }
        let line = format!("{}\n", record);
        // A poisoned lock or full disk must never take the loop down; the
        // run result still reaches the caller.
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
            let _ = file.flush();
        }
    }
}
