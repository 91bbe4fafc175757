//! CLI command implementations.

pub mod run;

use anyhow::{Context, Result};
use pipelocal_config::document::{DOCUMENT_FILE, load_document};
use std::path::{Path, PathBuf};

/// The pipeline file to use: `file` when given, otherwise the project's.
pub fn document_path(project: &Path, file: Option<&Path>) -> PathBuf {
    match file {
        Some(file) => file.to_path_buf(),
        None => project.join(DOCUMENT_FILE),
    }
}

pub fn list(project: &Path) -> Result<()> {
    let path = document_path(project, None);
    let document = load_document(&path)
        .with_context(|| format!("Failed to load pipeline file: {}", path.display()))?;

    for (i, name) in document.pipeline_names().iter().enumerate() {
        println!("{:>3}. {}", i + 1, name);
    }
    Ok(())
}

pub fn validate(path: &Path) -> Result<()> {
    match load_document(path) {
        Ok(_document) => {
            println!("Configuration is valid");
            Ok(())
        }
        Err(e) => anyhow::bail!("Configuration error in {}: {}", path.display(), e),
    }
}
