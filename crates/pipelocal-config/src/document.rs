//! Pipeline document loading and validation.

use crate::{ConfigError, ConfigResult};
use pipelocal_core::cache::CacheRegistry;
use pipelocal_core::pipeline::{Action, PipelineDocument, ScriptItem};
use std::path::Path;

/// File name looked up in the project directory.
pub const DOCUMENT_FILE: &str = "bitbucket-pipelines.yml";

/// Name of the built-in nested docker service.
pub const DOCKER_SERVICE: &str = "docker";

/// Parse and validate a pipeline document from YAML text.
pub fn parse_document(yaml: &str) -> ConfigResult<PipelineDocument> {
    let document: PipelineDocument = serde_yaml::from_str(yaml)?;
    validate(&document)?;
    Ok(document)
}

/// Read, parse and validate a pipeline document from disk.
pub fn load_document(path: &Path) -> ConfigResult<PipelineDocument> {
    let content = std::fs::read_to_string(path)?;
    parse_document(&content)
}

/// Check references between steps and shared definitions.
pub fn validate(document: &PipelineDocument) -> ConfigResult<()> {
    let caches = CacheRegistry::builtin().with_overrides(&document.definitions.caches);

    for step in document.all_steps() {
        for service in &step.services {
            if service != DOCKER_SERVICE && !document.definitions.services.contains_key(service) {
                return Err(ConfigError::InvalidReference(format!(
                    "step '{}' uses undefined service '{}'",
                    step.name(),
                    service
                )));
            }
        }

        for cache in &step.caches {
            if !caches.contains(cache) {
                return Err(ConfigError::InvalidReference(format!(
                    "step '{}' uses undefined cache '{}'",
                    step.name(),
                    cache
                )));
            }
        }

        for item in step.script.iter().chain(&step.after_script) {
            if let ScriptItem::Pipe(pipe) = item {
                if pipe.pipe.trim().is_empty() {
                    return Err(ConfigError::MissingField(format!(
                        "pipe image in step '{}'",
                        step.name()
                    )));
                }
            }
        }
    }

    for name in document.pipeline_names() {
        let Some(actions) = document.pipeline(&name) else {
            continue;
        };
        for action in actions {
            let empty = match action {
                Action::Step(_) => false,
                Action::Parallel(group) => group.steps.is_empty(),
                Action::Stage(stage) => stage.steps.is_empty(),
            };
            if empty {
                return Err(ConfigError::InvalidValue {
                    field: format!("pipelines.{name}"),
                    message: "parallel groups and stages need at least one step".to_string(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_document() {
        let yaml = r#"
definitions:
  services:
    redis:
      image: redis:7
pipelines:
  default:
    - step:
        services: [redis, docker]
        caches: [node]
        script:
          - npm test
"#;
        let doc = parse_document(yaml).unwrap();
        assert_eq!(doc.pipeline_names(), vec!["default"]);
    }

    #[test]
    fn test_undefined_service_rejected() {
        let yaml = r#"
pipelines:
  default:
    - step:
        services: [postgres]
        script: [echo]
"#;
        let err = parse_document(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidReference(ref m) if m.contains("postgres")));
    }

    #[test]
    fn test_undefined_cache_rejected() {
        let yaml = r#"
pipelines:
  custom:
    build:
      - step:
          caches: [mystery]
          script: [echo]
"#;
        let err = parse_document(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidReference(ref m) if m.contains("mystery")));
    }

    #[test]
    fn test_user_cache_accepted() {
        let yaml = r#"
definitions:
  caches:
    mystery: .cache/mystery
pipelines:
  default:
    - step:
        caches: [mystery]
        script: [echo]
"#;
        assert!(parse_document(yaml).is_ok());
    }

    #[test]
    fn test_empty_stage_rejected() {
        let yaml = r#"
pipelines:
  default:
    - stage:
        steps: []
"#;
        assert!(matches!(
            parse_document(yaml),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            parse_document("pipelines: [unclosed"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_load_document_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DOCUMENT_FILE);
        std::fs::write(&path, "pipelines:\n  default:\n    - step:\n        script: [ls]\n").unwrap();
        let doc = load_document(&path).unwrap();
        assert!(doc.pipeline("default").is_some());

        let missing = load_document(&dir.path().join("nope.yml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
