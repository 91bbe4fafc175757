//! Core domain types and traits for pipelocal.
//!
//! This crate contains:
//! - Run identifiers and the shared error type
//! - Task combinators and the execution context
//! - The container engine trait
//! - Pipeline document definitions
//! - The host-side cache store

pub mod cache;
pub mod engine;
pub mod error;
pub mod id;
pub mod pipeline;
pub mod task;
#[cfg(feature = "testing")]
pub mod testing;

pub use error::{Error, Result};
pub use id::RunId;
pub use task::{Task, TaskContext, chain, parallel};
