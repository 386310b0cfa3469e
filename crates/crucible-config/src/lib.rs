//! Configuration for the Crucible CI/CD engine.
//!
//! This crate handles:
//! - System configuration from the environment
//! - The pipeline format registry (on-disk file → pipeline value)
//! - `${{ ... }}` expression resolution for file-sourced pipelines

pub mod expr;
pub mod formats;
pub mod system;

pub use formats::{FormatRegistry, PipelineFormat, ResolvedPipeline};
pub use system::SystemConfig;
