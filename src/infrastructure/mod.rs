//! Infrastructure layer: everything that touches a disk, a process, or the
//! network.

pub mod event_log;
pub mod llm;
pub mod logging;
pub mod sandbox;
pub mod settings;

pub use event_log::EventLog;
pub use llm::{HttpModelClient, HttpModelConfig, ModelClient};
pub use sandbox::{ExecResult, Sandbox, WorktreeView, TIMEOUT_EXIT_CODE};
pub use settings::Settings;
