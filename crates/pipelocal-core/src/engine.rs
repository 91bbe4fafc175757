//! Container engine trait and request/response types.
//!
//! The engine is the only component that talks to a container daemon. The
//! higher-level lifecycle (networks owning containers, exec polling, tar
//! transfer) is built on top of these primitive calls.

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::time::Duration;

/// Raw byte stream returned by exec attach and archive download.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Tar archive sent to the engine in chunks.
pub type ArchiveStream = BoxStream<'static, Bytes>;

/// Registry credentials used for an image pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Host path bind mount.
    Bind,
    /// Named engine volume.
    Volume,
}

/// A mount attached to a container at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub kind: MountKind,
    /// Host path for binds, volume name for volumes.
    pub source: String,
    /// Path inside the container.
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Bind,
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Volume,
            source: name.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Container health check definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// Test command in engine form, e.g. `["CMD", "test", "-e", "/path"]`.
    pub test: Vec<String>,
    pub interval: Duration,
    pub start_period: Duration,
}

/// Everything the engine needs to create a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub user: Option<String>,
    /// Network to attach to.
    pub network: Option<String>,
    /// Alias of the container on `network`.
    pub alias: Option<String>,
    pub mounts: Vec<Mount>,
    pub health_check: Option<HealthCheck>,
    pub privileged: bool,
    pub tty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

/// Observed container state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
    /// `None` when the container declares no health check.
    pub health: Option<HealthStatus>,
}

/// An exec request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub working_dir: Option<String>,
    pub tty: bool,
}

/// Observed exec state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// Primitive operations against a container daemon.
///
/// Implementations map daemon "no such object" responses to
/// [`crate::Error::NotFound`] and every other failure to
/// [`crate::Error::Engine`].
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine name for logging.
    fn name(&self) -> &'static str;

    /// Whether `image` is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull `image`, returning once the pull completes.
    async fn pull_image(&self, image: &str, auth: Option<RegistryAuth>) -> Result<()>;

    /// Create a network, returning its id.
    async fn create_network(&self, name: &str) -> Result<String>;

    async fn remove_network(&self, id: &str) -> Result<()>;

    async fn create_volume(&self, name: &str) -> Result<()>;

    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Create a container, returning its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus>;

    /// Force-remove a container.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Create an exec session, returning its id.
    async fn create_exec(&self, container_id: &str, exec: &ExecSpec) -> Result<String>;

    /// Start an exec session and attach to its combined output.
    async fn start_exec(&self, exec_id: &str) -> Result<ByteStream>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus>;

    /// Extract a tar archive into `path` inside the container.
    async fn upload_archive(
        &self,
        container_id: &str,
        path: &str,
        archive: ArchiveStream,
    ) -> Result<()>;

    /// Download `path` from the container as a tar stream.
    async fn download_archive(&self, container_id: &str, path: &str) -> Result<ByteStream>;
}
