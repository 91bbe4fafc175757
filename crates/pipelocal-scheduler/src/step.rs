//! Step tasks.
//!
//! A step runs in its own build container on its own network. Its phases
//! are chained in a fixed order; the after-script and teardown always run.
//!
//! ```text
//! pull -> create -> services -> start -> clone -> restore caches
//!      -> download artifacts -> script -> save artifacts -> save caches
//!      finally after-script
//!      finally destroy network
//! ```

use crate::env::{self, StepIdentity};
use crate::git::{ChangeSet, ProjectInfo};
use crate::result::{RunResult, Status, StepIndex};
use chrono::Utc;
use futures::future::join_all;
use pipelocal_config::document::DOCKER_SERVICE;
use pipelocal_config::{RunnerConfig, VariableResolver};
use pipelocal_core::cache::{CacheStore, STATIC_KEY};
use pipelocal_core::engine::{ContainerEngine, HealthCheck, Mount};
use pipelocal_core::pipeline::{
    CacheSpec, Image, PipeInvocation, PipelineDocument, ScriptItem, ServiceSpec, Step,
};
use pipelocal_core::{Error, Result, Task, TaskContext, chain};
use pipelocal_executor::container::OutputSink;
use pipelocal_executor::tools::DOCKER_CLI_TARGET;
use pipelocal_executor::{Container, ContainerInput, CreateOptions, ExcludeSet, Network, archive};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

const CONTAINER_PREFIX: &str = "pl";
const BUILD_ALIAS: &str = "build";
const DAEMON_DIR: &str = "/var/run";
const ARTIFACT_TAR: &str = "artifact.tar";
const NO_SCRIPT: &str = "No script to run";

/// Prints the sha256 of the concatenated key files, or `NONE` if none exist.
const CACHE_KEY_SCRIPT: &str = r#"found=""
for f in {{patterns}}; do
  if [ -f "$f" ]; then found="$found $f"; fi
done
if [ -z "$found" ]; then
  echo NONE
else
  cat $found | sha256sum | cut -d ' ' -f 1
fi"#;

/// Everything a run shares between its steps.
pub(crate) struct RunScope {
    pub engine: Arc<dyn ContainerEngine>,
    pub config: RunnerConfig,
    pub document: PipelineDocument,
    pub project: ProjectInfo,
    pub secrets: HashMap<String, String>,
    pub caches: CacheStore,
    pub result: Arc<RunResult>,
    pub docker_cli: Option<PathBuf>,
    pub changes: ChangeSet,
    pub pipeline_id: Uuid,
}

/// Whether a step needs a docker daemon next to its build container.
pub(crate) fn needs_docker(step: &Step, document: &PipelineDocument) -> bool {
    step.uses_pipes()
        || step
            .services
            .iter()
            .any(|name| is_docker_service(name, document.definitions.services.get(name)))
}

fn is_docker_service(name: &str, spec: Option<&ServiceSpec>) -> bool {
    name == DOCKER_SERVICE || spec.and_then(|s| s.kind.as_deref()) == Some("docker")
}

struct ServiceContainer {
    container: Arc<Container>,
    options: CreateOptions,
}

/// State shared by the phases of one step.
struct StepRun {
    scope: Arc<RunScope>,
    step: Step,
    index: StepIndex,
    log_path: PathBuf,
    container: Arc<Container>,
    network: Arc<Network>,
    services: Vec<ServiceContainer>,
    nested_docker: bool,
}

/// Build the task for `step` at `index` and register its result entry.
pub(crate) fn step_task(scope: &Arc<RunScope>, step: &Step, index: StepIndex) -> Result<Task> {
    let name = step.name().to_string();
    let step_id = scope.result.add_step(index, &name)?;
    let config = &scope.config;

    let container_name = format!("{}-{}-{}", CONTAINER_PREFIX, scope.result.id(), index);
    let ci = env::ci_env(
        &scope.project,
        StepIdentity {
            run_id: scope.result.id(),
            pipeline_id: scope.pipeline_id,
            step_id,
            index,
        },
        &config.work_dir,
    );
    let env = env::build_env(ci, &scope.secrets, &step.environment);
    let resolver = env::resolver_for(&env);

    let image = step
        .image
        .as_ref()
        .or(scope.document.image.as_ref())
        .cloned()
        .unwrap_or_else(|| Image::named(&config.default_image));
    let container = Arc::new(Container::new(
        Arc::clone(&scope.engine),
        ContainerInput {
            name: container_name.clone(),
            image: resolver.resolve_image(&image),
            work_dir: config.work_dir.clone(),
            env: env.clone(),
            entrypoint: Some(vec!["/bin/sh".to_string()]),
            network_alias: BUILD_ALIAS.to_string(),
        },
    ));
    let network = Arc::new(Network::new(
        Arc::clone(&scope.engine),
        format!("net_{}", container_name),
    ));

    let nested_docker = needs_docker(step, &scope.document);
    if nested_docker && scope.docker_cli.is_none() {
        warn!(step = %name, "No docker CLI available for nested docker");
    }
    let services = service_containers(scope, step, &container, &env, &resolver, nested_docker)?;

    let run = Arc::new(StepRun {
        log_path: scope.result.log_path(index, &name),
        scope: Arc::clone(scope),
        step: step.clone(),
        index,
        container,
        network,
        services,
        nested_docker,
    });

    let mut body = chain([
        phase(&run, |run, ctx| async move { run.pull(&ctx).await }),
        phase(&run, |run, ctx| async move { run.create(&ctx).await }),
        phase(&run, |run, ctx| async move { run.create_services(&ctx).await }),
        phase(&run, |run, ctx| async move { run.start(&ctx).await }),
        phase(&run, |run, ctx| async move { run.clone_project(&ctx).await }),
        phase(&run, |run, ctx| async move { run.restore_caches(&ctx).await }),
        phase(&run, |run, ctx| async move { run.download_artifacts(&ctx).await }),
        with_cache_save(
            chain([
                phase(&run, |run, ctx| async move { run.run_script(&ctx).await }),
                phase(&run, |run, ctx| async move { run.save_artifacts(&ctx).await }),
            ]),
            phase(&run, |run, ctx| async move { run.save_caches(&ctx).await }),
        ),
    ]);
    if !step.after_script.is_empty() {
        body = body.finally(phase(&run, |run, ctx| async move {
            run.run_after_script(&ctx).await
        }));
    }
    body = body.finally(phase(&run, |run, ctx| async move { run.teardown(&ctx).await }));

    let timeout = step
        .max_time
        .map(|minutes| Duration::from_secs(minutes * 60))
        .unwrap_or_else(|| config.step_timeout());
    let mut task = body.with_timeout(timeout);
    if let Some(condition) = &step.condition {
        task = task.with_condition(scope.changes.predicate(condition.clone()));
    }

    Ok(observed(Arc::clone(&scope.result), index, name, task))
}

fn service_containers(
    scope: &RunScope,
    step: &Step,
    build: &Container,
    env: &BTreeMap<String, String>,
    resolver: &VariableResolver,
    nested_docker: bool,
) -> Result<Vec<ServiceContainer>> {
    let defined = &scope.document.definitions.services;
    let mut names: Vec<&str> = step.services.iter().map(String::as_str).collect();
    let has_daemon = names
        .iter()
        .any(|name| is_docker_service(name, defined.get(*name)));
    if nested_docker && !has_daemon {
        names.push(DOCKER_SERVICE);
    }

    let build_name = build.name();
    let work_dir = &build.input().work_dir;
    names
        .into_iter()
        .map(|service| {
            let definition = defined.get(service);
            let docker = is_docker_service(service, definition);
            let spec = match (definition, docker) {
                (Some(spec), _) => spec.clone(),
                (None, true) => ServiceSpec::default(),
                (None, false) => {
                    return Err(Error::NotFound(format!("service {} is not defined", service)));
                }
            };
            let image = match (&spec.image, docker) {
                (Some(image), _) => image.clone(),
                (None, true) => Image::named(&scope.config.default_docker_image),
                (None, false) => {
                    return Err(Error::InvalidInput(format!(
                        "service {} has no image",
                        service
                    )));
                }
            };

            let mut service_env = env.clone();
            service_env.extend(resolver.resolve_map(&spec.variables));

            let mut options = CreateOptions::default();
            if docker {
                options.mounts = vec![
                    Mount::volume(daemon_volume(build_name), DAEMON_DIR),
                    Mount::volume(build.work_volume(), work_dir.clone()),
                ];
            }

            let container = Container::new(
                Arc::clone(&scope.engine),
                ContainerInput {
                    name: format!("{}-{}", build_name, service),
                    image: resolver.resolve_image(&image),
                    work_dir: work_dir.clone(),
                    env: service_env,
                    entrypoint: docker.then(|| vec!["dockerd".to_string()]),
                    network_alias: service.to_string(),
                },
            );
            Ok(ServiceContainer {
                container: Arc::new(container),
                options,
            })
        })
        .collect()
}

fn daemon_volume(container: &str) -> String {
    format!("vol_{}-docker", container)
}

fn phase<F, Fut>(run: &Arc<StepRun>, f: F) -> Task
where
    F: Fn(Arc<StepRun>, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let run = Arc::clone(run);
    Task::new(move |ctx| f(Arc::clone(&run), ctx))
}

/// Run `body`, then `save` unless the context ended. `save` runs even when
/// `body` failed; the error of `body` wins.
fn with_cache_save(body: Task, save: Task) -> Task {
    Task::new(move |ctx: TaskContext| {
        let (body, save) = (body.clone(), save.clone());
        async move {
            let result = body.run(ctx.clone()).await;
            if let Some(err) = ctx.err() {
                return result.and(Err(err));
            }
            let saved = save.run(ctx).await;
            result.and(saved)
        }
    })
}

/// Wrap a step task with its span, status bookkeeping and start/end logs.
fn observed(result: Arc<RunResult>, index: StepIndex, name: String, task: Task) -> Task {
    Task::new(move |ctx: TaskContext| {
        let (result, name, task) = (Arc::clone(&result), name.clone(), task.clone());
        let span = info_span!("step", index = %index, name = %name);
        let ctx = ctx.with_span(span.clone());
        async move {
            info!("Start step");
            result.update_step(index, |step| {
                step.status = Status::Running;
                step.started_at = Some(Utc::now());
            });

            let outcome = task.run(ctx).await;
            match &outcome {
                Err(Error::Timeout(_) | Error::DeadlineExceeded) => info!("Step timeout"),
                Err(e) => error!(error = %e, "Step error"),
                Ok(()) => {}
            }

            // A phase after the script can still fail the step.
            result.update_step(index, |step| {
                if outcome.is_err() {
                    step.status = Status::Failed;
                } else if !step.status.is_terminal() {
                    step.status = Status::Success;
                }
                step.finished_at = Some(Utc::now());
            });
            if let Some(step) = result.step(index) {
                info!(
                    status = %step.status,
                    duration = ?step.duration().unwrap_or_default(),
                    "End step"
                );
            }
            outcome
        }
        .instrument(span)
    })
}

fn sh(script: impl Into<String>) -> Vec<String> {
    vec!["sh".to_string(), "-ce".to_string(), script.into()]
}

/// Echo each command before running it, separated by blank lines.
fn wrap_commands(commands: &[String]) -> String {
    commands
        .iter()
        .flat_map(|cmd| {
            [
                format!("echo {}", shell_words::quote(&format!("+ {}", cmd))),
                cmd.clone(),
                "echo \"\"".to_string(),
            ]
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Image a pipe runs from. `atlassian/<x>` pipes are published as
/// `bitbucketpipelines/<x>`.
pub fn pipe_image(pipe: &str) -> String {
    match pipe.split_once('/') {
        Some(("atlassian", rest)) if !rest.contains('/') => format!("bitbucketpipelines/{}", rest),
        _ => pipe.to_string(),
    }
}

/// Rewrite a pipe into a `docker run` of its image with the working tree
/// mounted and the step environment forwarded.
pub fn pipe_command(
    pipe: &PipeInvocation,
    work_dir: &str,
    env: &BTreeMap<String, String>,
    resolver: &VariableResolver,
) -> String {
    let variables = resolver.resolve_map(&pipe.variables);
    let mount = format!("{0}:{0}", work_dir);
    let mut args = vec![
        format!("-v {}", shell_words::quote(&mount)),
        format!("-v {0}:{0}:ro", DOCKER_CLI_TARGET),
    ];
    args.extend(
        env.keys()
            .filter(|key| !variables.contains_key(*key))
            .map(|key| format!("-e {0}=\"${0}\"", key)),
    );
    args.extend(
        variables
            .iter()
            .map(|(key, value)| format!("-e {}", shell_words::quote(&format!("{}={}", key, value)))),
    );

    format!(
        "docker run --rm -w $(pwd) \\\n  {} \\\n  {}",
        args.join(" \\\n  "),
        pipe_image(&pipe.pipe)
    )
}

/// The cache key printed by [`CACHE_KEY_SCRIPT`], if the output holds one.
fn parse_cache_key(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).rfind(|line| !line.is_empty())?;
    if line == "NONE" {
        return Some(STATIC_KEY.to_string());
    }
    let is_hash = line.len() == 64 && line.chars().all(|c| c.is_ascii_hexdigit());
    is_hash.then(|| line.to_string())
}

/// In-container location of a cache path.
fn cache_container_path(path: &str, work_dir: &str) -> String {
    if path == "~" {
        "/root".to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("/root/{}", rest)
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", work_dir.trim_end_matches('/'), path)
    }
}

fn parent_dir(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

impl StepRun {
    fn work_dir(&self) -> &str {
        &self.container.input().work_dir
    }

    async fn pull(&self, ctx: &TaskContext) -> Result<()> {
        self.container.ensure_image(ctx).await
    }

    async fn create(&self, ctx: &TaskContext) -> Result<()> {
        self.network.create(ctx).await?;

        let mut options = CreateOptions {
            work_volume: true,
            ..Default::default()
        };
        if self.nested_docker {
            options
                .owned_volumes
                .push((daemon_volume(self.container.name()), DAEMON_DIR.to_string()));
            if let Some(cli) = &self.scope.docker_cli {
                options
                    .mounts
                    .push(Mount::bind(cli.display().to_string(), DOCKER_CLI_TARGET).read_only());
            }
            options.health_check = Some(HealthCheck {
                test: ["CMD", "test", "-e", "/var/run/docker.sock"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                interval: Duration::from_secs(1),
                start_period: Duration::from_secs(1),
            });
        }
        self.container.create(ctx, &self.network, options).await
    }

    async fn create_services(&self, ctx: &TaskContext) -> Result<()> {
        for service in &self.services {
            debug!(service = %service.container.name(), "Creating service");
            service.container.ensure_image(ctx).await?;
            service
                .container
                .create(ctx, &self.network, service.options.clone())
                .await?;
        }
        Ok(())
    }

    /// Start every service, then the build container.
    async fn start(&self, ctx: &TaskContext) -> Result<()> {
        let started = join_all(self.services.iter().map(|service| async move {
            let result = service.container.start(ctx).await;
            match &result {
                Ok(()) => debug!(service = %service.container.name(), "Service started"),
                Err(e) => {
                    error!(service = %service.container.name(), error = %e, "Failed to start service")
                }
            }
            result
        }))
        .await;
        started.into_iter().collect::<Result<Vec<()>>>()?;

        self.container.start(ctx).await
    }

    /// Copy the project into the work dir, honoring `.gitignore`.
    async fn clone_project(&self, ctx: &TaskContext) -> Result<()> {
        let work_dir = self.work_dir();
        debug!(work_dir = %work_dir, "Preparing work dir");
        self.container
            .exec(
                ctx,
                "",
                sh(format!("mkdir -p {} && sync", shell_words::quote(work_dir))),
                None,
            )
            .await?;

        let project = &self.scope.project.path;
        let mut excludes = ExcludeSet::from_file(&project.join(".gitignore"))?;
        if let Ok(rel) = self.scope.result.path().strip_prefix(project) {
            if let Some(top) = rel.components().next() {
                excludes.extend([format!("/{}", top.as_os_str().to_string_lossy())]);
            }
        }

        debug!(project = %project.display(), "Copying project");
        self.container
            .copy_to_container(ctx, project, work_dir, &excludes)
            .await
    }

    /// Key of `spec` as computed in the build container. `None` when it
    /// cannot be determined.
    async fn cache_key(&self, ctx: &TaskContext, name: &str, spec: &CacheSpec) -> Option<String> {
        if spec.is_static() {
            return Some(STATIC_KEY.to_string());
        }

        let script = CACHE_KEY_SCRIPT.replace("{{patterns}}", &spec.key_files.join(" "));
        let mut output: Vec<u8> = Vec::new();
        let sink: OutputSink = &mut output;
        if let Err(e) = self
            .container
            .exec(ctx, self.work_dir(), sh(script), Some(sink))
            .await
        {
            warn!(cache = %name, error = %e, "Failed to compute cache key");
            return None;
        }

        let key = parse_cache_key(&String::from_utf8_lossy(&output));
        if key.is_none() {
            warn!(cache = %name, "Unexpected cache key output, skipping cache");
        }
        key
    }

    async fn restore_caches(&self, ctx: &TaskContext) -> Result<()> {
        let store = &self.scope.caches;
        for name in &self.step.caches {
            let Some(spec) = store.get(name) else {
                debug!(cache = %name, "Cache not defined");
                continue;
            };
            let Some(key) = self.cache_key(ctx, name, spec).await else {
                continue;
            };
            if !store.has_hash_path(name, &key) {
                info!(cache = %name, key = %key, "Cache miss");
                continue;
            }

            let target = cache_container_path(&spec.path, self.work_dir());
            let parent = parent_dir(&target);
            self.container
                .exec(ctx, "", sh(format!("mkdir -p {}", shell_words::quote(parent))), None)
                .await?;
            self.container
                .copy_to_container(ctx, &store.hash_path(name, &key), parent, &ExcludeSet::default())
                .await?;
            info!(cache = %name, key = %key, "Cache restored");
        }
        Ok(())
    }

    /// Save caches that have no entry for their current key yet. Failures
    /// are logged and skipped.
    async fn save_caches(&self, ctx: &TaskContext) -> Result<()> {
        let store = &self.scope.caches;
        for name in &self.step.caches {
            let Some(spec) = store.get(name) else {
                warn!(cache = %name, "Cache not defined");
                continue;
            };
            let Some(key) = self.cache_key(ctx, name, spec).await else {
                continue;
            };
            if store.has_hash_path(name, &key) {
                debug!(cache = %name, key = %key, "Cache already saved");
                continue;
            }

            let target = store.hash_path(name, &key);
            let source = cache_container_path(&spec.path, self.work_dir());
            match self.container.copy_to_host(ctx, &source, &target).await {
                Ok(()) => info!(cache = %name, key = %key, "Cache saved"),
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to save cache");
                    if target.exists() {
                        if let Err(e) = tokio::fs::remove_dir_all(&target).await {
                            warn!(path = %target.display(), error = %e, "Failed to remove partial cache");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn download_artifacts(&self, ctx: &TaskContext) -> Result<()> {
        if self.step.artifacts.as_ref().is_some_and(|a| !a.download) {
            return Ok(());
        }

        let result = &self.scope.result;
        for artifact in result.artifacts() {
            debug!(id = %artifact.id, pattern = %artifact.pattern, "Downloading artifacts");
            let source = result.artifacts_dir().join(&artifact.id);
            self.container
                .copy_to_container(ctx, &source, self.work_dir(), &ExcludeSet::default())
                .await?;
        }
        Ok(())
    }

    fn render(&self, items: &[ScriptItem]) -> Vec<String> {
        let env = &self.container.input().env;
        let resolver = env::resolver_for(env);
        items
            .iter()
            .map(|item| match item {
                ScriptItem::Command(cmd) => cmd.clone(),
                ScriptItem::Pipe(pipe) => pipe_command(pipe, self.work_dir(), env, &resolver),
            })
            .collect()
    }

    /// Run `commands` as one shell script, appending output to the step log.
    async fn run_commands(&self, ctx: &TaskContext, commands: &[String]) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        let sink: OutputSink = &mut log;
        self.container
            .exec(ctx, self.work_dir(), sh(wrap_commands(commands)), Some(sink))
            .await
    }

    /// Run the script and record its verdict on the step.
    async fn run_script(&self, ctx: &TaskContext) -> Result<()> {
        let results = &self.scope.result;
        if self.step.script.is_empty() {
            warn!("{}", NO_SCRIPT);
            results.update_step(self.index, |step| {
                step.outputs
                    .insert("script".to_string(), NO_SCRIPT.to_string());
                step.status = Status::Success;
            });
            return Ok(());
        }

        let outcome = self
            .run_commands(ctx, &self.render(&self.step.script))
            .await;
        let status = match outcome {
            Ok(()) => Status::Success,
            Err(_) => Status::Failed,
        };
        results.update_step(self.index, |step| step.status = status);
        outcome
    }

    /// Archive each artifact pattern in the container and unpack it under
    /// `artifacts/<id>`.
    async fn save_artifacts(&self, ctx: &TaskContext) -> Result<()> {
        let Some(artifacts) = &self.step.artifacts else {
            return Ok(());
        };
        let result = &self.scope.result;
        for pattern in artifacts.paths.iter().filter(|p| !p.trim().is_empty()) {
            let id = Uuid::new_v4().to_string();
            debug!(id = %id, pattern = %pattern, "Saving artifacts");

            self.container
                .exec(
                    ctx,
                    self.work_dir(),
                    sh(format!("tar cvf {} {}", ARTIFACT_TAR, pattern)),
                    None,
                )
                .await
                .map_err(|e| match e {
                    e if e.is_interrupted() => e,
                    e => Error::Artifact(format!("failed to archive {}: {}", pattern, e)),
                })?;

            let target = result.artifacts_dir().join(&id);
            self.container
                .copy_to_host(ctx, ARTIFACT_TAR, &target)
                .await?;

            let tarball = target.join(ARTIFACT_TAR);
            tokio::task::spawn_blocking(move || {
                archive::unpack_file(&tarball, &target)?;
                std::fs::remove_file(&tarball)
            })
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
            .map_err(|e| Error::Artifact(format!("failed to unpack {}: {}", pattern, e)))?;

            self.container
                .exec(ctx, self.work_dir(), sh(format!("rm {}", ARTIFACT_TAR)), None)
                .await?;
            result.register_artifact(id, pattern.clone());
        }
        Ok(())
    }

    async fn run_after_script(&self, ctx: &TaskContext) -> Result<()> {
        if self.container.id().is_none() {
            return Ok(());
        }
        info!("Running after-script");
        self.run_commands(ctx, &self.render(&self.step.after_script))
            .await
    }

    async fn teardown(&self, ctx: &TaskContext) -> Result<()> {
        debug!(network = %self.network.name(), "Destroying network and containers");
        self.network.destroy(ctx).await
    }
}
