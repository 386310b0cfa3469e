//! Build execution engine for Crucible.
//!
//! The pieces that turn a triggered build into stage/step records and a
//! replayable event stream:
//! - process runner with timeouts and cooperative cancellation
//! - workspace allocation and path confinement
//! - docker command generation for containerized steps
//! - artifact/dependency caches and stage-result fingerprints
//! - DAG scheduling with bounded parallelism
//! - approval gates
//! - the durable-then-broadcast event bus
//! - the end-to-end build executor

pub mod approval;
pub mod artifact;
pub mod bus;
pub mod cache;
pub mod dag;
pub mod docker;
pub mod process;
pub mod run;
pub mod scm;
pub mod secrets;
pub mod steps;
pub mod workspace;

pub use bus::{EventBus, Subscription};
pub use process::{ProcessOutcome, ProcessRequest, ProcessRunner};
pub use run::{Executor, ExecutorDeps};
pub use workspace::WorkspaceManager;
