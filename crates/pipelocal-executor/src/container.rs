//! Container and network lifecycle on top of a [`ContainerEngine`].
//!
//! A [`Network`] owns the containers created on it. Destroying the network
//! destroys its members first, newest first, then removes the network
//! itself. Every engine call is bounded by the caller's [`TaskContext`].

use crate::archive::{self, ExcludeSet};
use futures::StreamExt;
use pipelocal_core::engine::{
    ContainerEngine, ContainerSpec, ExecSpec, HealthCheck, HealthStatus, Mount, RegistryAuth,
};
use pipelocal_core::pipeline::Image;
use pipelocal_core::{Error, Result, TaskContext};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info, warn};

const START_POLL_INTERVAL: Duration = Duration::from_secs(1);
const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Destination for exec output.
pub type OutputSink<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

/// Recover an engine error carried through an `io::Error` by a stream reader.
fn stream_error(e: io::Error) -> Error {
    if !e.get_ref().is_some_and(|inner| inner.is::<Error>()) {
        return Error::Io(e);
    }
    match e.into_inner().map(|inner| inner.downcast::<Error>()) {
        Some(Ok(inner)) => *inner,
        Some(Err(inner)) => Error::Io(io::Error::other(inner)),
        None => Error::Internal("empty stream error".to_string()),
    }
}

/// What a container is created from.
#[derive(Debug, Clone)]
pub struct ContainerInput {
    pub name: String,
    /// Image with variables already resolved.
    pub image: Image,
    /// Working directory inside the container.
    pub work_dir: String,
    pub env: BTreeMap<String, String>,
    /// Overrides the image entrypoint when set.
    pub entrypoint: Option<Vec<String>>,
    /// Name other containers on the network reach this one by.
    pub network_alias: String,
}

/// Per-creation mount and health settings.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Create a volume owned by this container and mount it at the work dir.
    pub work_volume: bool,
    /// Additional owned volumes as `(name, target)`.
    pub owned_volumes: Vec<(String, String)>,
    /// Mounts of sources this container does not own.
    pub mounts: Vec<Mount>,
    pub health_check: Option<HealthCheck>,
}

#[derive(Debug, Default)]
struct ContainerState {
    id: Option<String>,
    volumes: Vec<String>,
}

/// A container managed through a [`ContainerEngine`].
pub struct Container {
    engine: Arc<dyn ContainerEngine>,
    input: ContainerInput,
    state: Mutex<ContainerState>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.input.name)
            .field("state", &*self.lock())
            .finish()
    }
}

impl Container {
    pub fn new(engine: Arc<dyn ContainerEngine>, input: ContainerInput) -> Self {
        Self {
            engine,
            input,
            state: Mutex::new(ContainerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ContainerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.input.name
    }

    pub fn input(&self) -> &ContainerInput {
        &self.input
    }

    /// Engine id, once created.
    pub fn id(&self) -> Option<String> {
        self.lock().id.clone()
    }

    fn require_id(&self) -> Result<String> {
        self.id().ok_or_else(|| {
            Error::NotFound(format!("container {} has not been created", self.input.name))
        })
    }

    /// Name of the volume [`CreateOptions::work_volume`] creates.
    pub fn work_volume(&self) -> String {
        format!("vol_{}", self.input.name)
    }

    /// Absolute container path; relative paths resolve against the work dir.
    pub fn container_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.input.work_dir.trim_end_matches('/'), path)
        }
    }

    fn registry_auth(&self) -> Option<RegistryAuth> {
        let image = &self.input.image;
        match (&image.username, &image.password) {
            (Some(username), Some(password)) if !username.is_empty() => Some(RegistryAuth {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    pub async fn image_exists(&self, ctx: &TaskContext) -> Result<bool> {
        ctx.guard(self.engine.image_exists(&self.input.image.name))
            .await
    }

    pub async fn pull(&self, ctx: &TaskContext) -> Result<()> {
        let image = &self.input.image;
        let auth = self.registry_auth();
        if auth.is_none() && image.aws.is_some() {
            warn!(image = %image.name, "AWS registry credentials are not supported, pulling anonymously");
        }
        info!(image = %image.name, "Pulling image");
        ctx.guard(self.engine.pull_image(&image.name, auth)).await
    }

    /// Pull the image unless it is already present.
    pub async fn ensure_image(&self, ctx: &TaskContext) -> Result<()> {
        if self.image_exists(ctx).await? {
            return Ok(());
        }
        self.pull(ctx).await
    }

    /// Create the container on `network`.
    ///
    /// The container joins the network before anything is created so a
    /// partial creation is still cleaned up by [`Network::destroy`].
    pub async fn create(
        self: &Arc<Self>,
        ctx: &TaskContext,
        network: &Network,
        options: CreateOptions,
    ) -> Result<()> {
        network.add_member(Arc::clone(self));

        let mut mounts = Vec::new();
        let mut owned = Vec::new();
        if options.work_volume {
            owned.push((self.work_volume(), self.input.work_dir.clone()));
        }
        owned.extend(options.owned_volumes);

        for (volume, target) in owned {
            debug!(container = %self.input.name, volume = %volume, "Creating volume");
            ctx.guard(self.engine.create_volume(&volume)).await?;
            self.lock().volumes.push(volume.clone());
            mounts.push(Mount::volume(volume, target));
        }
        mounts.extend(options.mounts);

        let spec = ContainerSpec {
            name: self.input.name.clone(),
            image: self.input.image.name.clone(),
            env: self.input.env.clone(),
            entrypoint: self.input.entrypoint.clone(),
            user: self.input.image.run_as_user.map(|uid| uid.to_string()),
            network: Some(network.name().to_string()),
            alias: Some(self.input.network_alias.clone()),
            mounts,
            health_check: options.health_check,
            privileged: true,
            tty: true,
        };

        let id = ctx.guard(self.engine.create_container(&spec)).await?;
        info!(container = %self.input.name, id = %id, "Created container");
        self.lock().id = Some(id);
        Ok(())
    }

    /// Start the container and wait until it runs and reports healthy.
    pub async fn start(&self, ctx: &TaskContext) -> Result<()> {
        let id = self.require_id()?;
        let name = &self.input.name;
        info!(container = %name, "Starting container");

        ctx.guard(async {
            self.engine.start_container(&id).await?;
            loop {
                let status = self.engine.inspect_container(&id).await?;
                if status.health == Some(HealthStatus::Unhealthy) {
                    return Err(Error::Engine(format!("container {} is unhealthy", name)));
                }
                if status.running && status.health != Some(HealthStatus::Starting) {
                    return Ok(());
                }
                if let (false, Some(code)) = (status.running, status.exit_code) {
                    return Err(Error::Engine(format!(
                        "container {} exited with code {}",
                        name, code
                    )));
                }
                debug!(container = %name, "Waiting for container");
                tokio::time::sleep(START_POLL_INTERVAL).await;
            }
        })
        .await
    }

    /// Run `cmd` in `work_dir`, streaming output to `sink`.
    ///
    /// A non-zero exit code yields [`Error::NonZeroExit`].
    pub async fn exec(
        &self,
        ctx: &TaskContext,
        work_dir: &str,
        cmd: Vec<String>,
        mut sink: Option<OutputSink<'_>>,
    ) -> Result<()> {
        let id = self.require_id()?;
        let spec = ExecSpec {
            cmd,
            working_dir: (!work_dir.is_empty()).then(|| work_dir.to_string()),
            tty: true,
        };
        debug!(container = %self.input.name, cmd = ?spec.cmd, "Exec");

        ctx.guard(async {
            let exec_id = self.engine.create_exec(&id, &spec).await?;
            let mut output = self.engine.start_exec(&exec_id).await?;
            while let Some(chunk) = output.next().await {
                let chunk = chunk?;
                if let Some(sink) = sink.as_mut() {
                    sink.write_all(&chunk).await?;
                }
            }
            if let Some(sink) = sink.as_mut() {
                sink.flush().await?;
            }

            loop {
                let status = self.engine.inspect_exec(&exec_id).await?;
                if !status.running {
                    return match status.exit_code.unwrap_or(0) {
                        0 => Ok(()),
                        code => Err(Error::NonZeroExit { code }),
                    };
                }
                tokio::time::sleep(EXEC_POLL_INTERVAL).await;
            }
        })
        .await
    }

    /// Copy the contents of `host_dir` into `container_dir`, skipping
    /// excluded paths.
    pub async fn copy_to_container(
        &self,
        ctx: &TaskContext,
        host_dir: &Path,
        container_dir: &str,
        excludes: &ExcludeSet,
    ) -> Result<()> {
        let id = self.require_id()?;
        let target = self.container_path(container_dir);
        debug!(container = %self.input.name, target = %target, "Uploading archive");

        let (chunks, packer) = archive::pack_dir_stream(host_dir.to_path_buf(), excludes.clone());
        ctx.guard(async move {
            let (uploaded, packed) =
                tokio::join!(self.engine.upload_archive(&id, &target, chunks), packer);
            let packed = packed.map_err(|e| Error::Internal(e.to_string()))?;
            match packed {
                // The engine stopped reading; its own error says why.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => uploaded,
                Err(e) => Err(e.into()),
                Ok(()) => uploaded,
            }
        })
        .await
    }

    /// Copy `container_path` (file or directory) into `host_dir`.
    pub async fn copy_to_host(
        &self,
        ctx: &TaskContext,
        container_path: &str,
        host_dir: &Path,
    ) -> Result<()> {
        let id = self.require_id()?;
        let source = self.container_path(container_path);
        debug!(container = %self.input.name, source = %source, "Downloading archive");

        let stream = ctx.guard(self.engine.download_archive(&id, &source)).await?;
        let reader = StreamReader::new(stream.map(|chunk| chunk.map_err(io::Error::other)));
        let dest = host_dir.to_path_buf();
        ctx.guard(async move {
            let reader = SyncIoBridge::new(reader);
            tokio::task::spawn_blocking(move || archive::unpack_reader(reader, &dest))
                .await
                .map_err(|e| Error::Internal(e.to_string()))?
                .map_err(stream_error)
        })
        .await
    }

    /// Force-remove the container and the volumes it owns. Does nothing if
    /// nothing was created.
    pub async fn destroy(&self, ctx: &TaskContext) -> Result<()> {
        let (id, volumes) = {
            let mut state = self.lock();
            (state.id.take(), std::mem::take(&mut state.volumes))
        };

        if let Some(id) = id {
            info!(container = %self.input.name, "Removing container");
            ctx.guard(self.engine.remove_container(&id)).await?;
        }
        for volume in volumes {
            debug!(container = %self.input.name, volume = %volume, "Removing volume");
            ctx.guard(self.engine.remove_volume(&volume)).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    id: Option<String>,
    members: Vec<Arc<Container>>,
}

/// A network and the containers created on it.
pub struct Network {
    engine: Arc<dyn ContainerEngine>,
    name: String,
    state: Mutex<NetworkState>,
}

impl Network {
    pub fn new(engine: Arc<dyn ContainerEngine>, name: impl Into<String>) -> Self {
        Self {
            engine,
            name: name.into(),
            state: Mutex::new(NetworkState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> Arc<dyn ContainerEngine> {
        Arc::clone(&self.engine)
    }

    pub async fn create(&self, ctx: &TaskContext) -> Result<()> {
        info!(network = %self.name, "Creating network");
        let id = ctx.guard(self.engine.create_network(&self.name)).await?;
        self.lock().id = Some(id);
        Ok(())
    }

    pub fn add_member(&self, container: Arc<Container>) {
        self.lock().members.push(container);
    }

    /// Members in the order they were added.
    pub fn members(&self) -> Vec<Arc<Container>> {
        self.lock().members.clone()
    }

    /// Destroy every member, newest first, then the network. Stops at the
    /// first failure.
    ///
    /// Services are created after the build container and may mount its
    /// volumes, so they go first.
    pub async fn destroy(&self, ctx: &TaskContext) -> Result<()> {
        for member in self.members().iter().rev() {
            member.destroy(ctx).await?;
        }
        self.lock().members.clear();

        let id = self.lock().id.take();
        if let Some(id) = id {
            info!(network = %self.name, "Removing network");
            ctx.guard(self.engine.remove_network(&id)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipelocal_core::testing::MockEngine;

    const WORK_DIR: &str = "/opt/atlassian/pipelines/agent/build";

    fn input(name: &str, image: &str) -> ContainerInput {
        ContainerInput {
            name: name.to_string(),
            image: Image::named(image),
            work_dir: WORK_DIR.to_string(),
            env: BTreeMap::from([("CI".to_string(), "true".to_string())]),
            entrypoint: Some(vec!["/bin/sh".to_string()]),
            network_alias: "build".to_string(),
        }
    }

    async fn running_container(
        engine: &Arc<MockEngine>,
        ctx: &TaskContext,
    ) -> (Network, Arc<Container>) {
        let engine_dyn: Arc<dyn ContainerEngine> = engine.clone();
        let network = Network::new(engine_dyn.clone(), "net_pl-test");
        network.create(ctx).await.unwrap();

        let container = Arc::new(Container::new(engine_dyn, input("pl-test", "alpine")));
        container.ensure_image(ctx).await.unwrap();
        let options = CreateOptions {
            work_volume: true,
            ..Default::default()
        };
        container.create(ctx, &network, options).await.unwrap();
        container.start(ctx).await.unwrap();
        (network, container)
    }

    #[tokio::test]
    async fn test_lifecycle_cleans_up() {
        let engine = Arc::new(MockEngine::new());
        let ctx = TaskContext::new();
        let (network, container) = running_container(&engine, &ctx).await;

        assert_eq!(engine.pulls(), vec!["alpine"]);
        assert_eq!(engine.containers(), vec!["pl-test"]);
        assert_eq!(engine.volumes(), vec!["vol_pl-test"]);
        let spec = engine.container_spec("pl-test").unwrap();
        assert_eq!(spec.network.as_deref(), Some("net_pl-test"));
        assert_eq!(spec.alias.as_deref(), Some("build"));
        assert_eq!(spec.mounts, vec![Mount::volume("vol_pl-test", WORK_DIR)]);
        assert!(spec.privileged && spec.tty);
        assert!(container.id().is_some());

        network.destroy(&ctx).await.unwrap();
        assert!(engine.containers().is_empty());
        assert!(engine.volumes().is_empty());
        assert!(engine.networks().is_empty());
        assert!(container.id().is_none());

        // Second destroy is a no-op
        network.destroy(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_present_image_not_pulled() {
        let engine = Arc::new(MockEngine::new().with_image("alpine"));
        let container = Container::new(engine.clone(), input("pl-test", "alpine"));
        container.ensure_image(&TaskContext::new()).await.unwrap();
        assert!(engine.pulls().is_empty());
    }

    #[tokio::test]
    async fn test_exec_streams_output() {
        let engine = Arc::new(MockEngine::new());
        let ctx = TaskContext::new();
        let (_network, container) = running_container(&engine, &ctx).await;

        let mut out: Vec<u8> = Vec::new();
        let sink: OutputSink = &mut out;
        container
            .exec(
                &ctx,
                WORK_DIR,
                vec!["sh".into(), "-ce".into(), "echo hello".into()],
                Some(sink),
            )
            .await
            .unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "echo hello\n");
        let executed = engine.executed();
        assert_eq!(executed[0].working_dir.as_deref(), Some(WORK_DIR));
    }

    #[tokio::test]
    async fn test_exec_nonzero_exit() {
        let engine = Arc::new(MockEngine::failing_on("exit 1"));
        let ctx = TaskContext::new();
        let (_network, container) = running_container(&engine, &ctx).await;

        let err = container
            .exec(&ctx, WORK_DIR, vec!["sh".into(), "-ce".into(), "exit 1".into()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NonZeroExit { code: 1 }));
    }

    #[tokio::test]
    async fn test_exec_requires_creation() {
        let engine = Arc::new(MockEngine::new());
        let container = Container::new(engine, input("pl-test", "alpine"));
        let err = container
            .exec(&TaskContext::new(), WORK_DIR, vec!["true".into()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_exec() {
        let engine = Arc::new(MockEngine::new());
        let ctx = TaskContext::new();
        let (_network, container) = running_container(&engine, &ctx).await;

        ctx.cancel();
        let err = container
            .exec(&ctx, WORK_DIR, vec!["true".into()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(engine.executed().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_never_created_is_noop() {
        let engine = Arc::new(MockEngine::new());
        let network = Network::new(engine.clone(), "net_unused");
        network.destroy(&TaskContext::new()).await.unwrap();

        let container = Container::new(engine, input("pl-test", "alpine"));
        container.destroy(&TaskContext::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_members_destroyed_in_order() {
        let engine = Arc::new(MockEngine::new().with_image("alpine").with_image("redis"));
        let ctx = TaskContext::new();
        let network = Network::new(engine.clone(), "net_pl-test");
        network.create(&ctx).await.unwrap();

        let build = Arc::new(Container::new(engine.clone(), input("pl-test", "alpine")));
        build
            .create(&ctx, &network, CreateOptions::default())
            .await
            .unwrap();
        let mut service_input = input("pl-test-redis", "redis");
        service_input.network_alias = "redis".to_string();
        let service = Arc::new(Container::new(engine.clone(), service_input));
        service
            .create(&ctx, &network, CreateOptions::default())
            .await
            .unwrap();

        let names: Vec<String> = network
            .members()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(names, vec!["pl-test", "pl-test-redis"]);

        network.destroy(&ctx).await.unwrap();
        assert!(engine.containers().is_empty());
        assert!(engine.networks().is_empty());
    }

    #[tokio::test]
    async fn test_failed_create_still_cleaned_up() {
        // Image never pulled: container creation fails after the volume exists
        let engine = Arc::new(MockEngine::new());
        let ctx = TaskContext::new();
        let network = Network::new(engine.clone(), "net_pl-test");
        network.create(&ctx).await.unwrap();

        let container = Arc::new(Container::new(engine.clone(), input("pl-test", "alpine")));
        let options = CreateOptions {
            work_volume: true,
            ..Default::default()
        };
        assert!(container.create(&ctx, &network, options).await.is_err());
        assert_eq!(engine.volumes(), vec!["vol_pl-test"]);

        network.destroy(&ctx).await.unwrap();
        assert!(engine.volumes().is_empty());
        assert!(engine.networks().is_empty());
    }

    #[tokio::test]
    async fn test_health_checked_start() {
        let engine = Arc::new(MockEngine::new().with_image("alpine"));
        let ctx = TaskContext::new();
        let network = Network::new(engine.clone(), "net_pl-test");
        network.create(&ctx).await.unwrap();

        let container = Arc::new(Container::new(engine.clone(), input("pl-test", "alpine")));
        let options = CreateOptions {
            owned_volumes: vec![("vol_pl-test-docker".to_string(), "/var/run".to_string())],
            health_check: Some(HealthCheck {
                test: vec!["CMD".into(), "test".into(), "-e".into(), "/var/run/docker.sock".into()],
                interval: Duration::from_secs(1),
                start_period: Duration::from_secs(1),
            }),
            ..Default::default()
        };
        container.create(&ctx, &network, options).await.unwrap();
        container.start(&ctx).await.unwrap();
        assert_eq!(engine.volumes(), vec!["vol_pl-test-docker"]);

        network.destroy(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_to_container() {
        let engine = Arc::new(MockEngine::new());
        let ctx = TaskContext::new();
        let (_network, container) = running_container(&engine, &ctx).await;

        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("main.rs"), "fn main() {}").unwrap();
        std::fs::write(project.path().join("debug.log"), "noise").unwrap();

        container
            .copy_to_container(&ctx, project.path(), WORK_DIR, &ExcludeSet::new(["*.log"]))
            .await
            .unwrap();

        let uploads = engine.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].1, WORK_DIR);

        let unpacked = tempfile::tempdir().unwrap();
        archive::unpack(&uploads[0].2, unpacked.path()).unwrap();
        assert!(unpacked.path().join("main.rs").exists());
        assert!(!unpacked.path().join("debug.log").exists());

        let missing = container
            .copy_to_container(&ctx, &project.path().join("nope"), WORK_DIR, &ExcludeSet::default())
            .await;
        assert!(
            matches!(missing, Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::NotFound),
            "{:?}",
            missing
        );
    }

    #[tokio::test]
    async fn test_copy_to_host() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("report.txt"), "ok").unwrap();
        let tar = archive::pack_dir(src.path(), &ExcludeSet::default()).unwrap();

        let engine = Arc::new(MockEngine::new().with_archive(format!("{WORK_DIR}/out"), tar));
        let ctx = TaskContext::new();
        let (_network, container) = running_container(&engine, &ctx).await;

        let dest = tempfile::tempdir().unwrap();
        container.copy_to_host(&ctx, "out", dest.path()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.path().join("report.txt")).unwrap(),
            "ok"
        );

        let missing = container.copy_to_host(&ctx, "/nope", dest.path()).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_stream_error_recovers_engine_error() {
        let wrapped = io::Error::other(Error::NotFound("no such path: /out".to_string()));
        assert!(matches!(stream_error(wrapped), Error::NotFound(_)));

        let plain = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        assert!(matches!(stream_error(plain), Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_container_path() {
        let container = Container::new(Arc::new(MockEngine::new()), input("pl-test", "alpine"));
        assert_eq!(container.container_path("/abs/path"), "/abs/path");
        assert_eq!(
            container.container_path("dist"),
            format!("{WORK_DIR}/dist")
        );
    }
}
