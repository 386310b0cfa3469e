//! Crucible remote agent.
//!
//! Accepts dispatched builds over HTTP, runs the executor locally, and
//! streams events, the final result, and artifacts back to the master.

pub mod client;
pub mod relay;
pub mod server;

pub use client::MasterClient;
pub use relay::RelayEventStore;
