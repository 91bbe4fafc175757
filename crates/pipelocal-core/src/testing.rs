//! In-memory container engine for tests.

use crate::engine::{
    ArchiveStream, ByteStream, ContainerEngine, ContainerSpec, ContainerStatus, ExecSpec, ExecStatus,
    HealthStatus, RegistryAuth,
};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MockState {
    images: BTreeSet<String>,
    pulls: Vec<String>,
    networks: BTreeSet<String>,
    volumes: BTreeSet<String>,
    containers: BTreeMap<String, ContainerSpec>,
    created: Vec<ContainerSpec>,
    running: BTreeSet<String>,
    execs: BTreeMap<String, (String, ExecSpec)>,
    executed: Vec<(String, ExecSpec)>,
    archives: BTreeMap<String, Bytes>,
    uploads: Vec<(String, String, Bytes)>,
    next_id: u64,
}

/// A [`ContainerEngine`] that keeps every object in memory.
///
/// Exec sessions echo their last command argument as output, unless an
/// output was registered with [`MockEngine::with_exec_output`] for them. An
/// exec whose command contains the configured failure marker exits with
/// code 1.
/// Archive downloads return whatever was registered with
/// [`MockEngine::with_archive`] for that path.
#[derive(Debug, Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
    fail_marker: Option<String>,
    exec_outputs: Vec<(String, String)>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execs containing `marker` in any argument exit with code 1.
    pub fn failing_on(marker: impl Into<String>) -> Self {
        Self {
            fail_marker: Some(marker.into()),
            ..Self::default()
        }
    }

    pub fn with_image(self, image: impl Into<String>) -> Self {
        self.lock().images.insert(image.into());
        self
    }

    /// Execs containing `marker` in any argument print `output`. The first
    /// registered match wins.
    pub fn with_exec_output(mut self, marker: impl Into<String>, output: impl Into<String>) -> Self {
        self.exec_outputs.push((marker.into(), output.into()));
        self
    }

    pub fn with_archive(self, path: impl Into<String>, archive: impl Into<Bytes>) -> Self {
        self.lock().archives.insert(path.into(), archive.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Names of containers that exist.
    pub fn containers(&self) -> Vec<String> {
        self.lock()
            .containers
            .values()
            .map(|spec| spec.name.clone())
            .collect()
    }

    pub fn container_spec(&self, name: &str) -> Option<ContainerSpec> {
        self.lock()
            .containers
            .values()
            .find(|spec| spec.name == name)
            .cloned()
    }

    /// Every container ever created, including removed ones, in order.
    pub fn created(&self) -> Vec<ContainerSpec> {
        self.lock().created.clone()
    }

    pub fn networks(&self) -> Vec<String> {
        self.lock().networks.iter().cloned().collect()
    }

    pub fn volumes(&self) -> Vec<String> {
        self.lock().volumes.iter().cloned().collect()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.lock().pulls.clone()
    }

    /// Every exec started, in order.
    pub fn executed(&self) -> Vec<ExecSpec> {
        self.lock()
            .executed
            .iter()
            .map(|(_, spec)| spec.clone())
            .collect()
    }

    /// Every archive upload as `(container id, path, archive)`.
    pub fn uploads(&self) -> Vec<(String, String, Bytes)> {
        self.lock().uploads.clone()
    }

    fn output(&self, exec: &ExecSpec) -> String {
        self.exec_outputs
            .iter()
            .find(|(marker, _)| exec.cmd.iter().any(|arg| arg.contains(marker.as_str())))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| exec.cmd.last().cloned().unwrap_or_default())
    }

    fn exit_code(&self, exec: &ExecSpec) -> i64 {
        match &self.fail_marker {
            Some(marker) if exec.cmd.iter().any(|arg| arg.contains(marker.as_str())) => 1,
            _ => 0,
        }
    }

    fn container_exists(state: &MockState, id: &str) -> Result<()> {
        if state.containers.contains_key(id) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("no such container: {id}")))
        }
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.lock().images.contains(image))
    }

    async fn pull_image(&self, image: &str, _auth: Option<RegistryAuth>) -> Result<()> {
        let mut state = self.lock();
        state.pulls.push(image.to_string());
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        if !self.lock().networks.insert(name.to_string()) {
            return Err(Error::Engine(format!("network {name} already exists")));
        }
        Ok(name.to_string())
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        let attached = state
            .containers
            .values()
            .any(|spec| spec.network.as_deref() == Some(id));
        if attached {
            return Err(Error::Engine(format!("network {id} has active endpoints")));
        }
        if !state.networks.remove(id) {
            return Err(Error::NotFound(format!("no such network: {id}")));
        }
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.lock().volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        if !self.lock().volumes.remove(name) {
            return Err(Error::NotFound(format!("no such volume: {name}")));
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.lock();
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(Error::Engine(format!("container {} already exists", spec.name)));
        }
        if !state.images.contains(&spec.image) {
            return Err(Error::NotFound(format!("no such image: {}", spec.image)));
        }
        state.next_id += 1;
        let id = format!("c{:04}", state.next_id);
        state.containers.insert(id.clone(), spec.clone());
        state.created.push(spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        Self::container_exists(&state, id)?;
        state.running.insert(id.to_string());
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus> {
        let state = self.lock();
        let spec = state
            .containers
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("no such container: {id}")))?;
        let running = state.running.contains(id);
        Ok(ContainerStatus {
            running,
            exit_code: None,
            health: spec
                .health_check
                .as_ref()
                .map(|_| HealthStatus::Healthy),
        })
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        Self::container_exists(&state, id)?;
        state.containers.remove(id);
        state.running.remove(id);
        Ok(())
    }

    async fn create_exec(&self, container_id: &str, exec: &ExecSpec) -> Result<String> {
        let mut state = self.lock();
        if !state.running.contains(container_id) {
            return Err(Error::Engine(format!(
                "container {container_id} is not running"
            )));
        }
        state.next_id += 1;
        let id = format!("e{:04}", state.next_id);
        state
            .execs
            .insert(id.clone(), (container_id.to_string(), exec.clone()));
        Ok(id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<ByteStream> {
        let mut state = self.lock();
        let (container, exec) = state
            .execs
            .get(exec_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no such exec: {exec_id}")))?;
        let output = self.output(&exec);
        state.executed.push((container, exec));
        let chunk: Result<Bytes> = Ok(Bytes::from(format!("{output}\n")));
        Ok(Box::pin(futures::stream::iter(vec![chunk])))
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus> {
        let state = self.lock();
        let (_, exec) = state
            .execs
            .get(exec_id)
            .ok_or_else(|| Error::NotFound(format!("no such exec: {exec_id}")))?;
        Ok(ExecStatus {
            running: false,
            exit_code: Some(self.exit_code(exec)),
        })
    }

    async fn upload_archive(
        &self,
        container_id: &str,
        path: &str,
        archive: ArchiveStream,
    ) -> Result<()> {
        Self::container_exists(&self.lock(), container_id)?;
        let chunks: Vec<Bytes> = archive.collect().await;
        let archive = Bytes::from(chunks.concat());

        let mut state = self.lock();
        Self::container_exists(&state, container_id)?;
        state
            .uploads
            .push((container_id.to_string(), path.to_string(), archive));
        Ok(())
    }

    async fn download_archive(&self, container_id: &str, path: &str) -> Result<ByteStream> {
        let state = self.lock();
        Self::container_exists(&state, container_id)?;
        let archive = state
            .archives
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no such path: {path}")))?;
        let chunk: Result<Bytes> = Ok(archive);
        Ok(Box::pin(futures::stream::iter(vec![chunk])))
    }
}
