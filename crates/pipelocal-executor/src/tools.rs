//! Host-side tools mounted into build containers.

use crate::archive;
use pipelocal_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Where the docker CLI is mounted inside build containers.
pub const DOCKER_CLI_TARGET: &str = "/usr/local/bin/docker";

const DOCKER_DOWNLOAD_URL: &str = "https://download.docker.com/linux/static/stable";

/// Location of the docker CLI binary for the host architecture.
pub fn docker_cli_path(tool_dir: &Path) -> PathBuf {
    tool_dir
        .join(std::env::consts::ARCH)
        .join("docker")
        .join("docker")
}

fn docker_cli_url(version: &str) -> String {
    format!(
        "{}/{}/docker-{}.tgz",
        DOCKER_DOWNLOAD_URL,
        std::env::consts::ARCH,
        version
    )
}

/// Make sure the static docker CLI of `version` is present under
/// `tool_dir`, downloading it on first use.
pub async fn ensure_docker_cli(tool_dir: &Path, version: &str) -> Result<PathBuf> {
    let path = docker_cli_path(tool_dir);
    if path.exists() {
        return Ok(path);
    }

    let url = docker_cli_url(version);
    info!(url = %url, "Downloading docker CLI");
    let response = reqwest::get(&url)
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| Error::Internal(format!("Failed to download docker CLI: {}", e)))?;
    let body = response
        .bytes()
        .await
        .map_err(|e| Error::Internal(format!("Failed to download docker CLI: {}", e)))?;

    let dest = tool_dir.join(std::env::consts::ARCH);
    tokio::task::spawn_blocking(move || unpack_tgz(&body, &dest))
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;

    if !path.exists() {
        return Err(Error::NotFound(format!(
            "docker CLI missing from {} after download",
            url
        )));
    }
    Ok(path)
}

fn unpack_tgz(data: &[u8], dest: &Path) -> std::io::Result<()> {
    archive::unpack_reader(flate2::read::GzDecoder::new(data), dest)
}
