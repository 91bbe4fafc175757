//! Pipeline runner - turns a pipeline's actions into one task and runs it.

use crate::git::{ChangeSet, ProjectInfo};
use crate::result::{RunResult, Status, StepIndex};
use crate::step::{self, RunScope};
use pipelocal_config::RunnerConfig;
use pipelocal_core::cache::{CacheRegistry, CacheStore};
use pipelocal_core::engine::ContainerEngine;
use pipelocal_core::pipeline::{Action, PipelineDocument, Step};
use pipelocal_core::task::available_workers;
use pipelocal_core::{Error, Result, Task, TaskContext, chain, parallel};
use pipelocal_executor::tools;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Instrument, Span, info, info_span, warn};
use uuid::Uuid;

/// Outcome of a run.
#[derive(Debug)]
pub struct RunReport {
    pub result: Arc<RunResult>,
    /// Error returned by the pipeline task, if any.
    pub error: Option<Error>,
}

impl RunReport {
    pub fn status(&self) -> Status {
        self.result.status()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status() == Status::Success
    }
}

/// Runs pipelines of one project.
pub struct Runner {
    engine: Arc<dyn ContainerEngine>,
    config: RunnerConfig,
    document: PipelineDocument,
    project: ProjectInfo,
    secrets: HashMap<String, String>,
    target_branch: Option<String>,
    docker_cli: Option<PathBuf>,
    parallelism: usize,
}

impl Runner {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        config: RunnerConfig,
        document: PipelineDocument,
        project: ProjectInfo,
    ) -> Self {
        Self {
            engine,
            config,
            document,
            project,
            secrets: HashMap::new(),
            target_branch: None,
            docker_cli: None,
            parallelism: available_workers(),
        }
    }

    pub fn with_secrets(mut self, secrets: HashMap<String, String>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Branch that change-set conditions compare against.
    pub fn with_target_branch(mut self, branch: Option<String>) -> Self {
        self.target_branch = branch;
        self
    }

    /// Use this docker CLI binary instead of downloading one.
    pub fn with_docker_cli(mut self, path: impl Into<PathBuf>) -> Self {
        self.docker_cli = Some(path.into());
        self
    }

    /// Upper bound on concurrently running steps of a parallel group.
    pub fn with_parallelism(mut self, workers: usize) -> Self {
        self.parallelism = workers.max(1);
        self
    }

    pub fn document(&self) -> &PipelineDocument {
        &self.document
    }

    /// Run the pipeline called `name`.
    ///
    /// Errors only when the run cannot be set up. Failures while running are
    /// reported in the returned [`RunReport`].
    pub async fn run(&self, name: &str, ctx: &TaskContext) -> Result<RunReport> {
        let actions = self
            .document
            .pipeline(name)
            .ok_or_else(|| Error::NotFound(format!("pipeline {} not found", name)))?;

        let output_dir = self.config.output_dir_for(&self.project.path);
        let result = Arc::new(RunResult::new(name, &output_dir));
        result.prepare_dirs()?;

        let span = info_span!("pipeline", name = %name, id = %result.id());
        async {
            let docker_cli = self.docker_cli(actions, ctx).await?;
            let registry = CacheRegistry::builtin().with_overrides(&self.document.definitions.caches);
            let scope = Arc::new(RunScope {
                engine: Arc::clone(&self.engine),
                config: self.config.clone(),
                document: self.document.clone(),
                project: self.project.clone(),
                secrets: self.secrets.clone(),
                caches: CacheStore::new(&output_dir, registry),
                result: Arc::clone(&result),
                docker_cli,
                changes: ChangeSet::new(&self.project.path, self.target_branch.clone()),
                pipeline_id: Uuid::new_v4(),
            });

            let tasks = action_tasks(&scope, actions, self.parallelism)?;
            let pipeline = summarized(
                Arc::clone(&result),
                chain(tasks).with_timeout(self.config.pipeline_timeout()),
            );

            info!(steps = result.steps().len(), "Starting pipeline");
            result.set_status(Status::Running);
            let error = pipeline.run(ctx.with_span(Span::current())).await.err();
            Ok::<_, Error>(RunReport {
                result: Arc::clone(&result),
                error,
            })
        }
        .instrument(span)
        .await
    }

    /// The docker CLI to mount, downloading it if a step needs one.
    async fn docker_cli(&self, actions: &[Action], ctx: &TaskContext) -> Result<Option<PathBuf>> {
        if self.docker_cli.is_some() {
            return Ok(self.docker_cli.clone());
        }
        let needed = actions
            .iter()
            .flat_map(Action::steps)
            .any(|step| step::needs_docker(step, &self.document));
        if !needed {
            return Ok(None);
        }
        let path = ctx
            .guard(tools::ensure_docker_cli(
                &self.config.tool_dir,
                &self.config.docker_version,
            ))
            .await?;
        Ok(Some(path))
    }
}

fn action_tasks(scope: &Arc<RunScope>, actions: &[Action], parallelism: usize) -> Result<Vec<Task>> {
    actions
        .iter()
        .zip(1u32..)
        .map(|(action, major)| match action {
            Action::Step(step) => step::step_task(scope, step, StepIndex::top(major)),
            Action::Parallel(group) => {
                if group.fail_fast {
                    warn!(index = major, "fail-fast is ignored, parallel steps always run to completion");
                }
                let members = member_tasks(scope, &group.steps, major)?;
                Ok(parallel(parallelism, members))
            }
            Action::Stage(stage) => {
                let members = chain(member_tasks(scope, &stage.steps, major)?);
                Ok(match &stage.condition {
                    Some(condition) => {
                        members.with_condition(scope.changes.predicate(condition.clone()))
                    }
                    None => members,
                })
            }
        })
        .collect()
}

fn member_tasks(scope: &Arc<RunScope>, steps: &[Step], major: u32) -> Result<Vec<Task>> {
    steps
        .iter()
        .zip(1u32..)
        .map(|(step, minor)| step::step_task(scope, step, StepIndex::member(major, minor)))
        .collect()
}

/// Run `pipeline`, then settle the run status from its outcome and log the
/// summary. The summary is written whatever the outcome.
fn summarized(result: Arc<RunResult>, pipeline: Task) -> Task {
    Task::new(move |ctx: TaskContext| {
        let (result, pipeline) = (Arc::clone(&result), pipeline.clone());
        async move {
            let outcome = pipeline.run(ctx).await;
            let status = result.finalize(outcome.is_err());
            info!(status = %status, "Pipeline result");
            info!(elapsed = ?result.duration(), "Total Elapsed Time");
            info!(path = %result.path().display(), "Output Path");
            outcome
        }
    })
}
