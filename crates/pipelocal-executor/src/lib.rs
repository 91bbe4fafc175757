//! Container runtime adapter for pipelocal.
//!
//! Provides:
//! - [`Container`] and [`Network`] lifecycle on top of any engine
//! - A Docker engine backed by bollard
//! - Tar transfer with ignore-file excludes
//! - The nested docker CLI download

pub mod archive;
pub mod container;
pub mod docker;
pub mod tools;

pub use archive::ExcludeSet;
pub use container::{Container, ContainerInput, CreateOptions, Network};
pub use docker::DockerEngine;
pub use pipelocal_core::engine::ContainerEngine;
