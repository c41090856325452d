//! Domain layer: models and error types with no I/O.

pub mod error;
pub mod models;

pub use error::{BailoutCause, ConfigError, ModelError, SandboxError};
