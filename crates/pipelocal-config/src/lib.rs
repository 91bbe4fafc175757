//! Configuration handling for pipelocal.
//!
//! This crate handles:
//! - Pipeline documents (bitbucket-pipelines.yml)
//! - Runner configuration
//! - Secrets files
//! - Variable resolution

pub mod document;
pub mod error;
pub mod secrets;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use system::RunnerConfig;
pub use variables::VariableResolver;
