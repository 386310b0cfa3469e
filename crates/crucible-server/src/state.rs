//! Shared application state.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crucible_config::system::SystemConfig;
use crucible_core::store::Stores;
use crucible_executor::EventBus;
use crucible_scheduler::{AgentRegistry, BuildRunner, Dispatcher};

#[derive(Clone)]
pub struct AppState {
    pub config: SystemConfig,
    pub stores: Stores,
    pub bus: Arc<EventBus>,
    pub runner: Arc<BuildRunner>,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<AgentRegistry>,
    pub instance_id: String,
    /// Flipped once migrations, hydration and recovery have finished;
    /// `/startup` reports 503 until then.
    pub started: Arc<AtomicBool>,
}
