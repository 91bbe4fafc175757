//! Pipeline document definitions.
//!
//! The document is decoded once with serde. Every node that the YAML format
//! allows in more than one shape (image, cache, action, parallel group,
//! script item, artifacts) is normalized here into a single Rust type, so
//! the executor only ever sees resolved variants.

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use tracing::warn;

/// A parsed pipeline document. Immutable once loaded.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineDocument {
    /// Default image for steps that do not declare one.
    pub image: Option<Image>,
    /// Shared cache and service definitions.
    pub definitions: Definitions,
    /// Pipelines keyed by trigger class.
    pub pipelines: Pipelines,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Definitions {
    pub caches: BTreeMap<String, CacheSpec>,
    pub services: BTreeMap<String, ServiceSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Pipelines {
    pub default: Option<Vec<Action>>,
    pub branches: BTreeMap<String, Vec<Action>>,
    pub pull_requests: BTreeMap<String, Vec<Action>>,
    pub tags: BTreeMap<String, Vec<Action>>,
    pub custom: BTreeMap<String, Vec<Action>>,
}

impl PipelineDocument {
    /// Look up a pipeline by run name.
    ///
    /// Accepts `default` (or an empty name), `branch/<n>`, `pr/<n>`,
    /// `tag/<n>`, and `custom/<n>` or a bare custom pipeline name.
    pub fn pipeline(&self, name: &str) -> Option<&[Action]> {
        if name.is_empty() || name == "default" {
            return self.pipelines.default.as_deref();
        }
        let actions = match name.split_once('/') {
            Some(("branch", n)) => self.pipelines.branches.get(n),
            Some(("pr", n)) => self.pipelines.pull_requests.get(n),
            Some(("tag", n)) => self.pipelines.tags.get(n),
            Some(("custom", n)) => self.pipelines.custom.get(n),
            _ => self.pipelines.custom.get(name),
        };
        actions.map(Vec::as_slice)
    }

    /// Every runnable pipeline name, in the form accepted by [`Self::pipeline`].
    pub fn pipeline_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.pipelines.default.is_some() {
            names.push("default".to_string());
        }
        let groups = [
            ("branch", &self.pipelines.branches),
            ("pr", &self.pipelines.pull_requests),
            ("tag", &self.pipelines.tags),
            ("custom", &self.pipelines.custom),
        ];
        for (prefix, group) in groups {
            names.extend(group.keys().map(|n| format!("{prefix}/{n}")));
        }
        names
    }

    /// All steps of all pipelines.
    pub fn all_steps(&self) -> impl Iterator<Item = &Step> {
        self.pipelines
            .default
            .iter()
            .chain(self.pipelines.branches.values())
            .chain(self.pipelines.pull_requests.values())
            .chain(self.pipelines.tags.values())
            .chain(self.pipelines.custom.values())
            .flatten()
            .flat_map(Action::steps)
    }
}

/// A container image reference with optional registry credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "ImageRepr")]
pub struct Image {
    pub name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Numeric uid the container runs as.
    pub run_as_user: Option<u32>,
    pub aws: Option<AwsAuth>,
}

impl Image {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Cloud registry credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AwsAuth {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub oidc_role: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ImageRepr {
    Name(String),
    Full(ImageFields),
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ImageFields {
    name: String,
    username: Option<String>,
    password: Option<String>,
    run_as_user: Option<u32>,
    aws: Option<AwsAuth>,
}

impl From<ImageRepr> for Image {
    fn from(repr: ImageRepr) -> Self {
        match repr {
            ImageRepr::Name(name) => Image::named(name),
            ImageRepr::Full(f) => Image {
                name: f.name,
                username: f.username,
                password: f.password,
                run_as_user: f.run_as_user,
                aws: f.aws,
            },
        }
    }
}

/// A named cache: a path inside the container plus the key files whose
/// content identifies a cache entry. No key files means a static cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "CacheRepr")]
pub struct CacheSpec {
    pub path: String,
    pub key_files: Vec<String>,
}

impl CacheSpec {
    pub fn new<I, S>(path: impl Into<String>, key_files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into(),
            key_files: key_files.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_static(&self) -> bool {
        self.key_files.is_empty()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CacheRepr {
    Path(String),
    Full {
        path: String,
        #[serde(default)]
        key: Option<CacheKey>,
    },
}

#[derive(Deserialize)]
struct CacheKey {
    #[serde(default)]
    files: Vec<String>,
}

impl From<CacheRepr> for CacheSpec {
    fn from(repr: CacheRepr) -> Self {
        match repr {
            CacheRepr::Path(path) => CacheSpec::new(path, Vec::<String>::new()),
            CacheRepr::Full { path, key } => {
                CacheSpec::new(path, key.map(|k| k.files).unwrap_or_default())
            }
        }
    }
}

/// A service container definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    pub image: Option<Image>,
    #[serde(deserialize_with = "string_map")]
    pub variables: BTreeMap<String, String>,
    pub memory: Option<u64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// One slot of a pipeline's ordered action list.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "ActionRepr")]
pub enum Action {
    Step(Step),
    Parallel(ParallelGroup),
    Stage(StageGroup),
}

impl Action {
    pub fn steps(&self) -> Vec<&Step> {
        match self {
            Action::Step(step) => vec![step],
            Action::Parallel(group) => group.steps.iter().collect(),
            Action::Stage(stage) => stage.steps.iter().collect(),
        }
    }
}

#[derive(Deserialize)]
struct ActionRepr {
    step: Option<Step>,
    parallel: Option<ParallelGroup>,
    stage: Option<StageGroup>,
}

impl TryFrom<ActionRepr> for Action {
    type Error = String;

    fn try_from(repr: ActionRepr) -> Result<Self, Self::Error> {
        match (repr.step, repr.parallel, repr.stage) {
            (Some(step), None, None) => Ok(Action::Step(step)),
            (None, Some(group), None) => Ok(Action::Parallel(group)),
            (None, None, Some(stage)) => Ok(Action::Stage(stage)),
            (None, None, None) => {
                Err("action must contain one of step, parallel or stage".to_string())
            }
            _ => Err("action must contain only one of step, parallel or stage".to_string()),
        }
    }
}

/// Steps run concurrently.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "ParallelRepr")]
pub struct ParallelGroup {
    pub steps: Vec<Step>,
    /// Parsed for completeness; siblings always run to completion.
    pub fail_fast: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ParallelRepr {
    List(Vec<StepItem>),
    Full {
        steps: Vec<StepItem>,
        #[serde(default, rename = "fail-fast")]
        fail_fast: bool,
    },
}

impl From<ParallelRepr> for ParallelGroup {
    fn from(repr: ParallelRepr) -> Self {
        let (items, fail_fast) = match repr {
            ParallelRepr::List(items) => (items, false),
            ParallelRepr::Full { steps, fail_fast } => (steps, fail_fast),
        };
        Self {
            steps: items.into_iter().map(|i| i.step).collect(),
            fail_fast,
        }
    }
}

/// Sequential steps gated by an optional change-set condition.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "StageRepr")]
pub struct StageGroup {
    pub name: Option<String>,
    pub steps: Vec<Step>,
    pub condition: Option<Condition>,
}

#[derive(Deserialize)]
struct StageRepr {
    #[serde(default)]
    name: Option<String>,
    steps: Vec<StepItem>,
    #[serde(default)]
    condition: Option<Condition>,
}

impl From<StageRepr> for StageGroup {
    fn from(repr: StageRepr) -> Self {
        Self {
            name: repr.name,
            steps: repr.steps.into_iter().map(|i| i.step).collect(),
            condition: repr.condition,
        }
    }
}

#[derive(Deserialize)]
struct StepItem {
    step: Step,
}

/// The atomic unit of pipeline work, run in one build container.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Step {
    pub name: Option<String>,
    pub image: Option<Image>,
    pub script: Vec<ScriptItem>,
    pub after_script: Vec<ScriptItem>,
    #[serde(deserialize_with = "string_map")]
    pub environment: BTreeMap<String, String>,
    /// Timeout override in minutes.
    pub max_time: Option<u64>,
    pub size: Option<String>,
    pub artifacts: Option<Artifacts>,
    pub caches: Vec<String>,
    pub services: Vec<String>,
    pub condition: Option<Condition>,
    pub trigger: Option<String>,
    pub deployment: Option<String>,
}

impl Step {
    /// Step name, `"default"` when unset or empty.
    pub fn name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or("default")
    }

    pub fn uses_pipes(&self) -> bool {
        self.script
            .iter()
            .chain(&self.after_script)
            .any(|item| matches!(item, ScriptItem::Pipe(_)))
    }
}

/// A script line: a shell command or a pipe invocation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ScriptItem {
    Command(String),
    Pipe(PipeInvocation),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PipeInvocation {
    /// Pipe image reference.
    pub pipe: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "string_map")]
    pub variables: BTreeMap<String, String>,
}

/// Files a step publishes for later steps.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "ArtifactsRepr")]
pub struct Artifacts {
    /// Glob patterns relative to the working directory.
    pub paths: Vec<String>,
    /// Whether this step downloads artifacts produced by earlier steps.
    pub download: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ArtifactsRepr {
    Paths(Vec<String>),
    Full {
        #[serde(default)]
        paths: Vec<String>,
        #[serde(default = "default_true")]
        download: bool,
    },
}

fn default_true() -> bool {
    true
}

impl From<ArtifactsRepr> for Artifacts {
    fn from(repr: ArtifactsRepr) -> Self {
        match repr {
            ArtifactsRepr::Paths(paths) => Artifacts {
                paths,
                download: true,
            },
            ArtifactsRepr::Full { paths, download } => Artifacts { paths, download },
        }
    }
}

/// Path-based run condition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Condition {
    pub changesets: ChangeSets,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChangeSets {
    pub include_paths: Vec<String>,
}

impl Condition {
    /// Whether any changed path matches any include pattern.
    pub fn matches<S: AsRef<str>>(&self, changed: &[S]) -> bool {
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        self.changesets
            .include_paths
            .iter()
            .filter_map(|raw| match Pattern::new(raw) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %raw, error = %e, "Ignoring invalid include path");
                    None
                }
            })
            .any(|pattern| {
                changed
                    .iter()
                    .any(|path| pattern.matches_with(path.as_ref(), options))
            })
    }
}

/// Deserialize a map of YAML scalars into strings.
fn string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Bool(bool),
        Int(i64),
        Float(f64),
        Str(String),
    }

    let raw = Option::<BTreeMap<String, Scalar>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Scalar::Bool(b) => b.to_string(),
                Scalar::Int(i) => i.to_string(),
                Scalar::Float(f) => f.to_string(),
                Scalar::Str(s) => s,
            };
            (key, value)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"
image: node:20
definitions:
  caches:
    deps: vendor
    smart:
      path: node_modules
      key:
        files:
          - package-lock.json
  services:
    postgres:
      image:
        name: postgres:16
        username: $REG_USER
      variables:
        POSTGRES_PORT: 5432
        POSTGRES_DB: app
pipelines:
  default:
    - step:
        name: Build
        script:
          - echo hello
          - pipe: atlassian/slack-notify:1.0.0
            variables:
              WEBHOOK: "${SLACK}"
              DEBUG: true
        artifacts:
          - dist/**
        caches:
          - smart
    - parallel:
        fail-fast: true
        steps:
          - step:
              script: [echo a]
          - step:
              script: [echo b]
    - stage:
        name: Deploy
        condition:
          changesets:
            includePaths:
              - "src/**"
        steps:
          - step:
              script: [echo deploy]
  branches:
    main:
      - parallel:
          - step:
              script: [echo m]
  custom:
    nightly:
      - step:
          image: alpine
          artifacts:
            download: false
            paths: [out.txt]
          script: [echo n]
"#;

    fn document() -> PipelineDocument {
        serde_yaml::from_str(DOCUMENT).unwrap()
    }

    #[test]
    fn test_image_scalar_and_object() {
        let doc = document();
        assert_eq!(doc.image, Some(Image::named("node:20")));
        let postgres = &doc.definitions.services["postgres"];
        let image = postgres.image.as_ref().unwrap();
        assert_eq!(image.name, "postgres:16");
        assert_eq!(image.username.as_deref(), Some("$REG_USER"));
        assert_eq!(postgres.variables["POSTGRES_PORT"], "5432");
    }

    #[test]
    fn test_cache_scalar_is_static() {
        let doc = document();
        assert!(doc.definitions.caches["deps"].is_static());
        let smart = &doc.definitions.caches["smart"];
        assert_eq!(smart.path, "node_modules");
        assert_eq!(smart.key_files, vec!["package-lock.json"]);
    }

    #[test]
    fn test_action_variants() {
        let doc = document();
        let actions = doc.pipeline("default").unwrap();
        assert_eq!(actions.len(), 3);
        assert!(matches!(actions[0], Action::Step(_)));
        match &actions[1] {
            Action::Parallel(group) => {
                assert!(group.fail_fast);
                assert_eq!(group.steps.len(), 2);
            }
            other => panic!("expected parallel, got {other:?}"),
        }
        match &actions[2] {
            Action::Stage(stage) => {
                assert_eq!(stage.name.as_deref(), Some("Deploy"));
                assert_eq!(stage.steps.len(), 1);
                assert!(stage.condition.is_some());
            }
            other => panic!("expected stage, got {other:?}"),
        }
    }

    #[test]
    fn test_parallel_list_form() {
        let doc = document();
        match &doc.pipeline("branch/main").unwrap()[0] {
            Action::Parallel(group) => {
                assert!(!group.fail_fast);
                assert_eq!(group.steps.len(), 1);
            }
            other => panic!("expected parallel, got {other:?}"),
        }
    }

    #[test]
    fn test_script_items() {
        let doc = document();
        let step = doc.pipeline("default").unwrap()[0].steps()[0].clone();
        assert_eq!(step.name(), "Build");
        assert!(step.uses_pipes());
        assert_eq!(step.script[0], ScriptItem::Command("echo hello".to_string()));
        match &step.script[1] {
            ScriptItem::Pipe(pipe) => {
                assert_eq!(pipe.pipe, "atlassian/slack-notify:1.0.0");
                assert_eq!(pipe.variables["WEBHOOK"], "${SLACK}");
                assert_eq!(pipe.variables["DEBUG"], "true");
            }
            other => panic!("expected pipe, got {other:?}"),
        }
    }

    #[test]
    fn test_artifacts_forms() {
        let doc = document();
        let build = doc.pipeline("default").unwrap()[0].steps()[0].clone();
        assert_eq!(
            build.artifacts,
            Some(Artifacts {
                paths: vec!["dist/**".to_string()],
                download: true
            })
        );
        let nightly = doc.pipeline("custom/nightly").unwrap()[0].steps()[0].clone();
        assert_eq!(
            nightly.artifacts,
            Some(Artifacts {
                paths: vec!["out.txt".to_string()],
                download: false
            })
        );
    }

    #[test]
    fn test_pipeline_lookup() {
        let doc = document();
        assert!(doc.pipeline("").is_some());
        assert!(doc.pipeline("nightly").is_some());
        assert!(doc.pipeline("custom/nightly").is_some());
        assert!(doc.pipeline("branch/develop").is_none());
        assert!(doc.pipeline("pr/main").is_none());
        assert_eq!(
            doc.pipeline_names(),
            vec!["default", "branch/main", "custom/nightly"]
        );
    }

    #[test]
    fn test_step_name_default() {
        let doc = document();
        let step = doc.pipeline("default").unwrap()[1].steps()[0].clone();
        assert_eq!(step.name(), "default");
        assert_eq!(doc.all_steps().count(), 6);
    }

    #[test]
    fn test_action_requires_exactly_one_kind() {
        let err = serde_yaml::from_str::<Vec<Action>>("- {}").unwrap_err();
        assert!(err.to_string().contains("one of step, parallel or stage"));

        let both = "- step: {script: [a]}\n  stage: {steps: []}";
        assert!(serde_yaml::from_str::<Vec<Action>>(both).is_err());
    }

    #[test]
    fn test_condition_matching() {
        let condition = Condition {
            changesets: ChangeSets {
                include_paths: vec!["src/**/*.rs".to_string(), "*.md".to_string()],
            },
        };
        assert!(condition.matches(&["src/lib/task.rs"]));
        assert!(condition.matches(&["README.md"]));
        assert!(!condition.matches(&["docs/guide.md"]));
        assert!(!condition.matches::<&str>(&[]));
        assert!(!Condition::default().matches(&["src/lib.rs"]));
    }
}
