//! Runner configuration.
//!
//! Stored as JSON in `~/.pipelocal/config.json` and created with defaults
//! the first time it is loaded. Missing fields fall back to their defaults.

use crate::ConfigResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const CONFIG_DIR: &str = ".pipelocal";
const CONFIG_FILE: &str = "config.json";

/// Runner-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Image for steps when neither the step nor the document declares one.
    pub default_image: String,
    /// Working directory of the build inside containers.
    pub work_dir: String,
    /// Where logs, artifacts and caches are written. Relative paths resolve
    /// against the project directory.
    pub output_dir: PathBuf,
    /// Version of the docker CLI mounted into build containers.
    pub docker_version: String,
    /// Image of the nested docker daemon service.
    pub default_docker_image: String,
    /// Where downloaded tools are kept.
    pub tool_dir: PathBuf,
    pub max_step_timeout_minutes: u64,
    pub max_pipeline_timeout_minutes: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_image: "atlassian/default-image:4".to_string(),
            work_dir: "/opt/atlassian/pipelines/agent/build".to_string(),
            output_dir: PathBuf::from(".pipelocal"),
            docker_version: "19.03.15".to_string(),
            default_docker_image: "docker:27.0.3-dind-alpine3.20".to_string(),
            tool_dir: config_dir().join("tools"),
            max_step_timeout_minutes: 120,
            max_pipeline_timeout_minutes: 240,
        }
    }
}

/// `~/.pipelocal`, or `.pipelocal` when no home directory is known.
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIR))
        .unwrap_or_else(|| PathBuf::from(CONFIG_DIR))
}

/// Default location of the configuration file.
pub fn default_config_path() -> PathBuf {
    config_dir().join(CONFIG_FILE)
}

impl RunnerConfig {
    /// Load configuration from `path`.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load configuration from `path`, writing the defaults there first if
    /// the file does not exist.
    pub fn load_or_init(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        config.save(path)?;
        info!(path = %path.display(), "Created default configuration");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.max_step_timeout_minutes * 60)
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs(self.max_pipeline_timeout_minutes * 60)
    }

    /// Output directory for a project.
    pub fn output_dir_for(&self, project: &Path) -> PathBuf {
        if self.output_dir.is_absolute() {
            self.output_dir.clone()
        } else {
            project.join(&self.output_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.default_image, "atlassian/default-image:4");
        assert_eq!(config.work_dir, "/opt/atlassian/pipelines/agent/build");
        assert_eq!(config.step_timeout(), Duration::from_secs(120 * 60));
        assert!(config.tool_dir.ends_with("tools"));
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: RunnerConfig =
            serde_json::from_str(r#"{"default_image": "ubuntu:24.04"}"#).unwrap();
        assert_eq!(config.default_image, "ubuntu:24.04");
        assert_eq!(config.docker_version, "19.03.15");
        assert_eq!(config.max_pipeline_timeout_minutes, 240);
    }

    #[test]
    fn test_load_or_init_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let created = RunnerConfig::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created, RunnerConfig::default());

        let mut changed = created.clone();
        changed.max_step_timeout_minutes = 5;
        changed.save(&path).unwrap();
        assert_eq!(RunnerConfig::load_or_init(&path).unwrap(), changed);
    }

    #[test]
    fn test_output_dir_resolution() {
        let project = Path::new("/work/project");
        let mut config = RunnerConfig::default();
        assert_eq!(
            config.output_dir_for(project),
            PathBuf::from("/work/project/.pipelocal")
        );

        config.output_dir = PathBuf::from("/tmp/out");
        assert_eq!(config.output_dir_for(project), PathBuf::from("/tmp/out"));
    }

    #[test]
    fn test_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            RunnerConfig::load(&path),
            Err(crate::ConfigError::Json(_))
        ));
    }
}
