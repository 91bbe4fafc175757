//! Host-side cache store.
//!
//! Caches live under `<output_dir>/cache/<name>/<hash>`. The hash is derived
//! from the content of a cache's key files, or is [`STATIC_KEY`] for caches
//! without key files.

use crate::pipeline::CacheSpec;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Key used for caches without key files.
pub const STATIC_KEY: &str = "static";

/// Immutable set of named cache definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheRegistry {
    caches: BTreeMap<String, CacheSpec>,
}

impl CacheRegistry {
    /// Caches for common package managers.
    pub fn builtin() -> Self {
        let entries = [
            ("node", CacheSpec::new("node_modules", ["package.json"])),
            (
                "gradle",
                CacheSpec::new(
                    "~/.gradle/caches",
                    ["build.gradle", "build.gradle.kts", "settings.gradle.kts"],
                ),
            ),
            ("maven", CacheSpec::new("~/.m2/repository", ["pom.xml"])),
            ("pip", CacheSpec::new("~/.cache/pip", ["requirements.txt"])),
            (
                "composer",
                CacheSpec::new("~/.composer/cache", ["composer.json"]),
            ),
            (
                "dotnetcore",
                CacheSpec::new("~/.nuget/packages", ["packages.config"]),
            ),
            ("ivy", CacheSpec::new("~/.ivy2/cache", ["ivy.xml"])),
            ("sbt", CacheSpec::new("~/.sbt", ["build.sbt"])),
        ];
        Self {
            caches: entries
                .into_iter()
                .map(|(name, spec)| (name.to_string(), spec))
                .collect(),
        }
    }

    /// Registry with `overrides` replacing entries of the same name.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, CacheSpec>) -> Self {
        self.caches
            .extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn get(&self, name: &str) -> Option<&CacheSpec> {
        self.caches.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.caches.keys().map(String::as_str)
    }
}

/// Named, content-addressed cache directories on the host.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    registry: CacheRegistry,
}

impl CacheStore {
    /// Store rooted at `<output_dir>/cache`.
    pub fn new(output_dir: impl AsRef<Path>, registry: CacheRegistry) -> Self {
        Self {
            root: output_dir.as_ref().join("cache"),
            registry,
        }
    }

    pub fn get(&self, name: &str) -> Option<&CacheSpec> {
        self.registry.get(name)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hash_path(&self, name: &str, hash: &str) -> PathBuf {
        self.root.join(name).join(hash)
    }

    pub fn has_hash_path(&self, name: &str, hash: &str) -> bool {
        self.hash_path(name, hash).exists()
    }
}
