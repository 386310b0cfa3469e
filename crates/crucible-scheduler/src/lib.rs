//! Build lifecycle and dispatch for Crucible.
//!
//! The master-side machinery around the executor: the bounded local build
//! pool with its cancellation registry and orphan watchdog, the agent
//! registry, the dispatcher with per-agent circuit breakers, the durable
//! queue drainer, and the leader-gated singleton schedulers.

pub mod breaker;
pub mod dispatch;
pub mod drain;
pub mod leader;
pub mod registry;
pub mod retention;
pub mod runner;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use drain::QueueProcessor;
pub use leader::LeaderLoop;
pub use registry::AgentRegistry;
pub use runner::BuildRunner;
