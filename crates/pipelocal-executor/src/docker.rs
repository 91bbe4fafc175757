//! Docker engine implementation.

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    EndpointSettings, HealthConfig, HealthStatusEnum, HostConfig, Mount as DockerMount,
    MountTypeEnum,
};
use bollard::network::CreateNetworkOptions;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bytes::Bytes;
use futures::StreamExt;
use pipelocal_core::engine::*;
use pipelocal_core::{Error, Result};
use std::collections::HashMap;
use tracing::{debug, info};

/// Container engine talking to the local Docker daemon.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Engine(format!("Failed to connect to Docker: {}", e)))?;
        Ok(Self { docker })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| engine_error("Failed to ping Docker", e))?;
        Ok(())
    }
}

fn engine_error(context: &str, e: bollard::errors::Error) -> Error {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => Error::NotFound(format!("{}: {}", context, message)),
        other => Error::Engine(format!("{}: {}", context, other)),
    }
}

/// Pulling without a tag fetches every tag of the repository.
fn with_default_tag(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') || last.contains('@') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

fn to_docker_mount(mount: &Mount) -> DockerMount {
    DockerMount {
        target: Some(mount.target.clone()),
        source: Some(mount.source.clone()),
        typ: Some(match mount.kind {
            MountKind::Bind => MountTypeEnum::BIND,
            MountKind::Volume => MountTypeEnum::VOLUME,
        }),
        read_only: Some(mount.read_only),
        ..Default::default()
    }
}

fn to_docker_config(spec: &ContainerSpec) -> Config<String> {
    let env: Vec<String> = spec
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let host_config = HostConfig {
        mounts: Some(spec.mounts.iter().map(to_docker_mount).collect()),
        network_mode: spec.network.clone(),
        privileged: Some(spec.privileged),
        ..Default::default()
    };

    let networking_config = spec.network.as_ref().map(|network| NetworkingConfig {
        endpoints_config: HashMap::from([(
            network.clone(),
            EndpointSettings {
                aliases: spec.alias.clone().map(|alias| vec![alias]),
                ..Default::default()
            },
        )]),
    });

    let healthcheck = spec.health_check.as_ref().map(|check| HealthConfig {
        test: Some(check.test.clone()),
        interval: Some(check.interval.as_nanos() as i64),
        start_period: Some(check.start_period.as_nanos() as i64),
        ..Default::default()
    });

    Config {
        image: Some(spec.image.clone()),
        env: Some(env),
        entrypoint: spec.entrypoint.clone(),
        user: spec.user.clone(),
        tty: Some(spec.tty),
        healthcheck,
        host_config: Some(host_config),
        networking_config,
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(engine_error("Failed to inspect image", e)),
        }
    }

    async fn pull_image(&self, image: &str, auth: Option<RegistryAuth>) -> Result<()> {
        let options = CreateImageOptions {
            from_image: with_default_tag(image),
            ..Default::default()
        };
        let credentials = auth.map(|auth| DockerCredentials {
            username: Some(auth.username),
            password: Some(auth.password),
            ..Default::default()
        });

        info!(image = %image, "Pulling image");
        let mut pull_stream = self.docker.create_image(Some(options), None, credentials);
        while let Some(result) = pull_stream.next().await {
            let info = result.map_err(|e| engine_error("Failed to pull image", e))?;
            if let Some(status) = info.status {
                debug!(image = %image, status = %status, "Pull progress");
            }
        }
        Ok(())
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|e| engine_error("Failed to create network", e))?;
        Ok(name.to_string())
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        self.docker
            .remove_network(id)
            .await
            .map_err(|e| engine_error("Failed to remove network", e))
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            ..Default::default()
        };
        self.docker
            .create_volume(options)
            .await
            .map_err(|e| engine_error("Failed to create volume", e))?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
            .map_err(|e| engine_error("Failed to remove volume", e))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        info!(container = %spec.name, image = %spec.image, "Creating container");
        let container = self
            .docker
            .create_container(Some(options), to_docker_config(spec))
            .await
            .map_err(|e| engine_error("Failed to create container", e))?;
        Ok(container.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| engine_error("Failed to start container", e))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus> {
        let inspect = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| engine_error("Failed to inspect container", e))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Engine(format!("Container {} has no state", id)))?;

        let health = state
            .health
            .and_then(|health| health.status)
            .and_then(|status| match status {
                HealthStatusEnum::STARTING => Some(HealthStatus::Starting),
                HealthStatusEnum::HEALTHY => Some(HealthStatus::Healthy),
                HealthStatusEnum::UNHEALTHY => Some(HealthStatus::Unhealthy),
                _ => None,
            });

        Ok(ContainerStatus {
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
            health,
        })
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| engine_error("Failed to remove container", e))
    }

    async fn create_exec(&self, container_id: &str, exec: &ExecSpec) -> Result<String> {
        let options = CreateExecOptions {
            cmd: Some(exec.cmd.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(exec.tty),
            working_dir: exec.working_dir.clone(),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(container_id, options)
            .await
            .map_err(|e| engine_error("Failed to create exec", e))?;
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<ByteStream> {
        let started = self
            .docker
            .start_exec(exec_id, None)
            .await
            .map_err(|e| engine_error("Failed to start exec", e))?;

        match started {
            StartExecResults::Attached { output, .. } => Ok(Box::pin(output.map(|result| {
                result
                    .map(|output| match output {
                        LogOutput::StdOut { message }
                        | LogOutput::StdErr { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => message,
                    })
                    .map_err(|e| engine_error("Exec output failed", e))
            }))),
            StartExecResults::Detached => Ok(Box::pin(futures::stream::empty::<Result<Bytes>>())),
        }
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| engine_error("Failed to inspect exec", e))?;
        Ok(ExecStatus {
            running: inspect.running.unwrap_or(false),
            exit_code: inspect.exit_code,
        })
    }

    async fn upload_archive(
        &self,
        container_id: &str,
        path: &str,
        archive: ArchiveStream,
    ) -> Result<()> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container_streaming(container_id, Some(options), archive)
            .await
            .map_err(|e| engine_error("Failed to upload archive", e))
    }

    async fn download_archive(&self, container_id: &str, path: &str) -> Result<ByteStream> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let stream = self
            .docker
            .download_from_container(container_id, Some(options))
            .map(|result| result.map_err(|e| engine_error("Failed to download archive", e)));
        Ok(Box::pin(stream))
    }
}
