//! Run identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a single pipeline run.
///
/// Backed by a UUIDv7 so directory listings of past runs sort by start time.
/// Rendered as `r-` followed by the simple (hyphen-free) UUID form, which is
/// safe to embed in container, network and directory names.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("r-{}", _0.simple())]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let raw = s.strip_prefix("r-").unwrap_or(s);
        Ok(Self(Uuid::parse_str(raw)?))
    }
}
