//! Project metadata and change-set detection from git.

use pipelocal_core::pipeline::Condition;
use pipelocal_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::warn;
use uuid::Uuid;

/// Facts about the project being built.
///
/// Values git cannot provide are left empty.
#[derive(Debug, Clone)]
pub struct ProjectInfo {
    pub path: PathBuf,
    pub id: Uuid,
    pub owner: String,
    pub owner_id: Uuid,
    pub slug: String,
    pub repo_id: Uuid,
    pub branch: String,
    pub commit: String,
}

impl ProjectInfo {
    pub fn from_path(path: &Path) -> Self {
        let run_git = |args: &[&str]| -> Option<String> {
            Command::new("git")
                .args(args)
                .current_dir(path)
                .output()
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        };

        let dir_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let origin = run_git(&["remote", "get-url", "origin"])
            .as_deref()
            .and_then(parse_origin);
        let (owner, slug) = match origin {
            Some(origin) => origin,
            None => (
                run_git(&["log", "--reverse", "--pretty=format:%an", "-n", "1"])
                    .unwrap_or_default(),
                dir_name,
            ),
        };

        Self {
            path: path.to_path_buf(),
            id: Uuid::new_v4(),
            owner,
            owner_id: Uuid::new_v4(),
            slug,
            repo_id: Uuid::new_v4(),
            branch: run_git(&["rev-parse", "--abbrev-ref", "HEAD"]).unwrap_or_default(),
            commit: run_git(&["rev-parse", "HEAD"]).unwrap_or_default(),
        }
    }

    /// `owner/slug`, or just the slug when the owner is unknown.
    pub fn full_name(&self) -> String {
        if self.owner.is_empty() {
            self.slug.clone()
        } else {
            format!("{}/{}", self.owner, self.slug)
        }
    }
}

/// Owner and repository slug from an ssh or https remote URL.
fn parse_origin(url: &str) -> Option<(String, String)> {
    let url = url.trim().trim_end_matches('/');
    let url = url.strip_suffix(".git").unwrap_or(url);
    let path = match url.split_once("://") {
        Some((_, rest)) => rest.split_once('/')?.1,
        None => url.split_once(':')?.1,
    };
    let (owner, slug) = path.rsplit_once('/')?;
    let owner = owner.rsplit('/').next().unwrap_or(owner);
    if owner.is_empty() || slug.is_empty() {
        return None;
    }
    Some((owner.to_string(), slug.to_string()))
}

fn git_lines(path: &Path, args: &[&str]) -> Result<Vec<String>> {
    let output = Command::new("git").args(args).current_dir(path).output()?;
    if !output.status.success() {
        return Err(Error::InvalidInput(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Files changed in the working tree, plus those changed on `HEAD` since it
/// diverged from `target` when one is given. Sorted and deduplicated.
pub fn changed_files(path: &Path, target: Option<&str>) -> Result<Vec<String>> {
    let mut files = git_lines(path, &["diff", "--name-only", "HEAD"])?;
    if let Some(target) = target {
        let range = format!("{}...HEAD", target);
        files.extend(git_lines(path, &["diff", "--name-only", &range])?);
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// Evaluates path conditions against the project's change-set.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    project: PathBuf,
    target: Option<String>,
}

impl ChangeSet {
    pub fn new(project: impl Into<PathBuf>, target: Option<String>) -> Self {
        Self {
            project: project.into(),
            target,
        }
    }

    /// Whether `condition` holds. Failing to read the change-set counts as
    /// not holding.
    pub fn matches(&self, condition: &Condition) -> bool {
        match changed_files(&self.project, self.target.as_deref()) {
            Ok(files) => condition.matches(&files),
            Err(e) => {
                warn!(error = %e, "Failed to read changed files");
                false
            }
        }
    }

    /// A predicate for [`pipelocal_core::Task::with_condition`].
    pub fn predicate(&self, condition: Condition) -> impl Fn() -> bool + Send + Sync + 'static {
        let changes = self.clone();
        move || changes.matches(&condition)
    }
}
