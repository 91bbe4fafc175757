//! Environment variables exposed to build containers.

use crate::git::ProjectInfo;
use crate::result::StepIndex;
use pipelocal_config::VariableResolver;
use pipelocal_core::RunId;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

const SSH_KEY_FILE: &str = "/opt/atlassian/pipelines/agent/ssh/id_rsa";

/// Identity of the step an environment is built for.
#[derive(Debug, Clone, Copy)]
pub struct StepIdentity<'a> {
    pub run_id: &'a RunId,
    pub pipeline_id: Uuid,
    pub step_id: Uuid,
    pub index: StepIndex,
}

/// The standard CI variables for a step.
pub fn ci_env(
    project: &ProjectInfo,
    step: StepIdentity<'_>,
    work_dir: &str,
) -> BTreeMap<String, String> {
    let vars = [
        ("BITBUCKET_BUILD_NUMBER", step.run_id.to_string()),
        ("BITBUCKET_BRANCH", project.branch.clone()),
        ("BITBUCKET_CLONE_DIR", work_dir.to_string()),
        ("BITBUCKET_COMMIT", project.commit.clone()),
        ("BITBUCKET_PIPELINE_UUID", step.pipeline_id.to_string()),
        ("BITBUCKET_PROJECT_KEY", project.slug.clone()),
        ("BITBUCKET_PROJECT_UUID", project.id.to_string()),
        ("BITBUCKET_REPO_FULL_NAME", project.full_name()),
        ("BITBUCKET_REPO_IS_PRIVATE", "true".to_string()),
        ("BITBUCKET_REPO_OWNER", project.owner.clone()),
        ("BITBUCKET_REPO_OWNER_UUID", project.owner_id.to_string()),
        ("BITBUCKET_REPO_SLUG", project.slug.clone()),
        ("BITBUCKET_REPO_UUID", project.repo_id.to_string()),
        ("BITBUCKET_SSH_KEY_FILE", SSH_KEY_FILE.to_string()),
        ("BITBUCKET_STEP_RUN_NUMBER", step.index.to_string()),
        ("BITBUCKET_STEP_TRIGGERER_UUID", project.owner_id.to_string()),
        ("BITBUCKET_STEP_UUID", step.step_id.to_string()),
        ("BITBUCKET_WORKSPACE", project.owner.clone()),
        ("CI", "true".to_string()),
        ("DOCKER_HOST", "unix:///var/run/docker.sock".to_string()),
    ];
    vars.into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Merge CI variables, secrets and the step's own environment, in
/// increasing precedence. Step values are resolved against CI variables
/// and secrets first.
pub fn build_env(
    ci: BTreeMap<String, String>,
    secrets: &HashMap<String, String>,
    step_env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = ci;
    env.extend(secrets.iter().map(|(k, v)| (k.clone(), v.clone())));

    let resolved = resolver_for(&env).resolve_map(step_env);
    env.extend(resolved);
    env
}

/// A resolver over an environment map.
pub fn resolver_for(env: &BTreeMap<String, String>) -> VariableResolver {
    VariableResolver::new(env.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn project() -> ProjectInfo {
        ProjectInfo {
            path: PathBuf::from("/work/app"),
            id: Uuid::new_v4(),
            owner: "team".to_string(),
            owner_id: Uuid::new_v4(),
            slug: "app".to_string(),
            repo_id: Uuid::new_v4(),
            branch: "main".to_string(),
            commit: "abc123".to_string(),
        }
    }

    #[test]
    fn test_ci_env() {
        let run_id = RunId::new();
        let step_id = Uuid::new_v4();
        let env = ci_env(
            &project(),
            StepIdentity {
                run_id: &run_id,
                pipeline_id: Uuid::new_v4(),
                step_id,
                index: StepIndex::member(2, 1),
            },
            "/build",
        );

        assert_eq!(env["CI"], "true");
        assert_eq!(env["DOCKER_HOST"], "unix:///var/run/docker.sock");
        assert_eq!(env["BITBUCKET_BUILD_NUMBER"], run_id.to_string());
        assert_eq!(env["BITBUCKET_STEP_RUN_NUMBER"], "2.1");
        assert_eq!(env["BITBUCKET_STEP_UUID"], step_id.to_string());
        assert_eq!(env["BITBUCKET_CLONE_DIR"], "/build");
        assert_eq!(env["BITBUCKET_REPO_FULL_NAME"], "team/app");
        assert_eq!(env["BITBUCKET_BRANCH"], "main");
    }

    #[test]
    fn test_build_env_precedence() {
        let ci = BTreeMap::from([
            ("CI".to_string(), "true".to_string()),
            ("BITBUCKET_BRANCH".to_string(), "main".to_string()),
        ]);
        let secrets = HashMap::from([
            ("TOKEN".to_string(), "s3cr3t".to_string()),
            ("CI".to_string(), "overridden".to_string()),
        ]);
        let step = BTreeMap::from([
            ("AUTH".to_string(), "Bearer ${TOKEN}".to_string()),
            ("BRANCH".to_string(), "$BITBUCKET_BRANCH".to_string()),
            ("TOKEN".to_string(), "from-step".to_string()),
        ]);

        let env = build_env(ci, &secrets, &step);
        assert_eq!(env["CI"], "overridden");
        assert_eq!(env["AUTH"], "Bearer s3cr3t");
        assert_eq!(env["BRANCH"], "main");
        assert_eq!(env["TOKEN"], "from-step");
    }
}
