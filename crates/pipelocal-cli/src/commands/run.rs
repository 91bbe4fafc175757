//! Local pipeline execution command.

use super::document_path;
use anyhow::{Context, Result};
use pipelocal_config::document::load_document;
use pipelocal_config::secrets::load_secrets;
use pipelocal_config::system::default_config_path;
use pipelocal_config::RunnerConfig;
use pipelocal_core::TaskContext;
use pipelocal_executor::DockerEngine;
use pipelocal_scheduler::{ProjectInfo, RunReport, Runner, Status};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub struct RunArgs {
    pub project: PathBuf,
    pub name: String,
    pub secrets: Option<PathBuf>,
    pub target_branch: String,
    pub file: Option<PathBuf>,
}

/// Branch to diff against. Only pull-request pipelines have one.
fn target_for(name: &str, target_branch: &str) -> Option<String> {
    name.starts_with("pr/").then(|| target_branch.to_string())
}

/// Run a pipeline locally using Docker.
pub async fn run(args: RunArgs) -> Result<()> {
    let project = args
        .project
        .canonicalize()
        .with_context(|| format!("Failed to resolve project: {}", args.project.display()))?;

    let config_path = default_config_path();
    let config = RunnerConfig::load_or_init(&config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;

    let path = document_path(&project, args.file.as_deref());
    let document = load_document(&path)
        .with_context(|| format!("Failed to load pipeline file: {}", path.display()))?;

    let secrets = match &args.secrets {
        Some(path) => load_secrets(path)
            .with_context(|| format!("Failed to load secrets: {}", path.display()))?,
        None => Default::default(),
    };

    let engine = DockerEngine::new().context("Failed to connect to Docker")?;
    engine.ping().await.context("Docker daemon is not reachable")?;

    let info = ProjectInfo::from_path(&project);
    info!(project = %project.display(), branch = %info.branch, "Project");

    let runner = Runner::new(Arc::new(engine), config, document, info)
        .with_secrets(secrets)
        .with_target_branch(target_for(&args.name, &args.target_branch));

    let ctx = TaskContext::new();
    let interrupt = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling run");
                ctx.cancel();
            }
        })
    };

    let report = runner.run(&args.name, &ctx).await;
    interrupt.abort();
    let report = report.with_context(|| format!("Failed to run pipeline {}", args.name))?;

    print_report(&report);

    if let Some(e) = report.error {
        anyhow::bail!("Pipeline {} failed: {}", args.name, e);
    }
    if report.status() != Status::Success {
        warn!(pipeline = %args.name, "Some steps failed");
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let result = &report.result;
    println!("\n--- Step Summary ---");
    for step in result.steps() {
        let marker = match step.status {
            Status::Success => "✓",
            Status::Failed => "✗",
            Status::Pending => "○",
            Status::Running => "▶",
        };
        let elapsed = step
            .duration()
            .map(|d| format!(" ({:.1}s)", d.as_secs_f64()))
            .unwrap_or_default();
        println!("  {} {} {} - {}{}", marker, step.index, step.name, step.status, elapsed);
    }

    let artifacts = result.artifacts();
    if !artifacts.is_empty() {
        println!("\n--- Artifacts ---");
        for artifact in artifacts {
            println!("  {} <- {}", artifact.id, artifact.pattern);
        }
    }

    println!("\nPipeline {}: {}", result.pipeline(), result.status());
    println!("Output: {}", result.path().display());
}
