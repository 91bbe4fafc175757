//! Pipeline execution for pipelocal.
//!
//! Builds one task per pipeline action, runs steps in containers through
//! the executor and records results under the run's output directory.

pub mod env;
pub mod git;
pub mod orchestrator;
pub mod result;
mod step;

pub use git::{ChangeSet, ProjectInfo};
pub use orchestrator::{RunReport, Runner};
pub use result::{ArtifactRecord, RunResult, Status, StepIndex, StepResult};
pub use step::{pipe_command, pipe_image};
