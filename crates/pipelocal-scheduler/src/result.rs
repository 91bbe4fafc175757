//! Run and step results.
//!
//! A [`RunResult`] is shared by every step task of a run. Each step task
//! writes only its own [`StepResult`]; the artifact registry is append-only.

use chrono::{DateTime, Utc};
use derive_more::Display;
use pipelocal_core::{Error, Result, RunId};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Position of a step in its pipeline.
///
/// Top-level steps are numbered from 1. Members of a parallel group or stage
/// at position `n` are `n.1`, `n.2`, ... Ordering is by major then minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepIndex {
    major: u32,
    minor: Option<u32>,
}

impl StepIndex {
    pub fn top(major: u32) -> Self {
        Self { major, minor: None }
    }

    pub fn member(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor: Some(minor),
        }
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> Option<u32> {
        self.minor
    }
}

impl fmt::Display for StepIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minor {
            Some(minor) => write!(f, "{}.{}", self.major, minor),
            None => write!(f, "{}", self.major),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Status {
    #[display("pending")]
    Pending,
    #[display("running")]
    Running,
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Failed)
    }
}

/// Record of one step execution.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub id: Uuid,
    pub index: StepIndex,
    pub name: String,
    pub status: Status,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outputs: BTreeMap<String, String>,
}

impl StepResult {
    fn new(index: StepIndex, name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            index,
            name: name.to_string(),
            status: Status::Pending,
            started_at: None,
            finished_at: None,
            outputs: BTreeMap::new(),
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.finished_at?);
        (end - start).to_std().ok()
    }
}

/// Where an artifact was saved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub id: String,
    pub pattern: String,
}

#[derive(Debug)]
struct RunState {
    status: Status,
    steps: BTreeMap<StepIndex, StepResult>,
    artifacts: Vec<ArtifactRecord>,
}

/// Record of one pipeline run.
#[derive(Debug)]
pub struct RunResult {
    id: RunId,
    pipeline: String,
    path: PathBuf,
    state: Mutex<RunState>,
}

impl RunResult {
    /// New run writing its logs and artifacts under `<output_dir>/<run id>`.
    pub fn new(pipeline: impl Into<String>, output_dir: &Path) -> Self {
        let id = RunId::new();
        Self {
            path: output_dir.join(id.to_string()),
            id,
            pipeline: pipeline.into(),
            state: Mutex::new(RunState {
                status: Status::Pending,
                steps: BTreeMap::new(),
                artifacts: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &RunId {
        &self.id
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// `<output_dir>/<run id>`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.path.join("logs")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.path.join("artifacts")
    }

    /// Log file of a step. Path separators in the name become `-`.
    pub fn log_path(&self, index: StepIndex, name: &str) -> PathBuf {
        let name = name.replace(['/', '\\'], "-");
        self.logs_dir().join(format!("{}-{}.log", index, name))
    }

    /// Create the run's log and artifact directories.
    pub fn prepare_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.artifacts_dir())?;
        Ok(())
    }

    /// Register a pending step. Indexes are never reused within a run.
    pub fn add_step(&self, index: StepIndex, name: &str) -> Result<Uuid> {
        let mut state = self.lock();
        if state.steps.contains_key(&index) {
            return Err(Error::InvalidInput(format!(
                "step index {} already used",
                index
            )));
        }
        let step = StepResult::new(index, name);
        let id = step.id;
        state.steps.insert(index, step);
        Ok(id)
    }

    /// Apply `f` to the step at `index`, if registered.
    pub fn update_step<F>(&self, index: StepIndex, f: F)
    where
        F: FnOnce(&mut StepResult),
    {
        if let Some(step) = self.lock().steps.get_mut(&index) {
            f(step);
        }
    }

    pub fn step(&self, index: StepIndex) -> Option<StepResult> {
        self.lock().steps.get(&index).cloned()
    }

    /// All steps in index order.
    pub fn steps(&self) -> Vec<StepResult> {
        self.lock().steps.values().cloned().collect()
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    pub fn set_status(&self, status: Status) {
        self.lock().status = status;
    }

    /// Settle the run status: failed if the pipeline was aborted or any
    /// step failed, otherwise success.
    pub fn finalize(&self, aborted: bool) -> Status {
        let mut state = self.lock();
        let failed = aborted
            || state
                .steps
                .values()
                .any(|step| step.status == Status::Failed);
        state.status = if failed {
            Status::Failed
        } else {
            Status::Success
        };
        state.status
    }

    pub fn register_artifact(&self, id: impl Into<String>, pattern: impl Into<String>) {
        self.lock().artifacts.push(ArtifactRecord {
            id: id.into(),
            pattern: pattern.into(),
        });
    }

    /// Artifacts in the order they were saved.
    pub fn artifacts(&self) -> Vec<ArtifactRecord> {
        self.lock().artifacts.clone()
    }

    /// Time from the earliest step start to the latest step end.
    pub fn duration(&self) -> Duration {
        let state = self.lock();
        let start = state.steps.values().filter_map(|s| s.started_at).min();
        let end = state.steps.values().filter_map(|s| s.finished_at).max();
        match (start, end) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }
}
