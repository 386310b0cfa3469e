//! System-wide configuration.
//!
//! Everything is environment-driven with workable defaults, so a bare
//! `crucible-server` starts in embedded mode without a config file.

use std::path::PathBuf;
use std::time::Duration;

/// System-wide configuration shared by the master and the executor.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Base directory for per-build workspaces.
    pub workspace_root: PathBuf,
    /// Base directory for collected artifacts.
    pub artifact_root: PathBuf,
    /// Base directory for saved cache trees.
    pub cache_root: PathBuf,
    /// Postgres URL; None selects the embedded in-memory engine.
    pub database_url: Option<String>,
    /// Base64 master key for secret sealing (32 bytes decoded).
    pub master_key_b64: Option<String>,
    /// Shared bearer token authenticating agent↔master calls.
    pub agent_token: String,
    /// Bounded local build pool on the master.
    pub max_local_builds: usize,
    /// Simultaneous stages per build in DAG mode.
    pub max_stage_concurrency: usize,
    /// Default per-step timeout when the pipeline declares none.
    pub default_step_timeout: Duration,
    /// Heartbeats older than this read as offline.
    pub heartbeat_stale: Duration,
    /// Extra grace before a stale-agent build is declared orphaned.
    pub orphan_grace: Duration,
    pub leader_poll: Duration,
    /// Route triggers through the durable queue.
    pub queue_enabled: bool,
    /// Consider remote agents at all.
    pub distributed_dispatch: bool,
    /// Run on the master pool when no agent is available.
    pub fallback_local: bool,
    pub dedup_enabled: bool,
    pub dedup_window: Duration,
    pub incremental_artifacts: bool,
    pub event_ttl_days: u32,
    pub cache_max_age_days: u32,
    pub cache_max_total_bytes: u64,
    /// Address the master listens on.
    pub listen_addr: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/var/lib/crucible/workspaces"),
            artifact_root: PathBuf::from("/var/lib/crucible/artifacts"),
            cache_root: PathBuf::from("/var/lib/crucible/cache"),
            database_url: None,
            master_key_b64: None,
            agent_token: String::new(),
            max_local_builds: 4,
            max_stage_concurrency: 4,
            default_step_timeout: Duration::from_secs(3600),
            heartbeat_stale: Duration::from_secs(90),
            orphan_grace: Duration::from_secs(120),
            leader_poll: Duration::from_secs(15),
            queue_enabled: false,
            distributed_dispatch: false,
            fallback_local: true,
            dedup_enabled: false,
            dedup_window: Duration::from_secs(300),
            incremental_artifacts: false,
            event_ttl_days: 30,
            cache_max_age_days: 14,
            cache_max_total_bytes: 10 * 1024 * 1024 * 1024,
            listen_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl SystemConfig {
    /// Load configuration from `CRUCIBLE_*` environment variables, falling
    /// back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("CRUCIBLE_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("CRUCIBLE_ARTIFACT_ROOT") {
            config.artifact_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("CRUCIBLE_CACHE_ROOT") {
            config.cache_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("DATABASE_URL") {
            config.database_url = Some(val);
        }
        if let Ok(val) = std::env::var("CRUCIBLE_MASTER_KEY") {
            config.master_key_b64 = Some(val);
        }
        if let Ok(val) = std::env::var("CRUCIBLE_AGENT_TOKEN") {
            config.agent_token = val;
        }
        if let Ok(val) = std::env::var("CRUCIBLE_MAX_LOCAL_BUILDS") {
            if let Ok(v) = val.parse() {
                config.max_local_builds = v;
            }
        }
        if let Ok(val) = std::env::var("CRUCIBLE_MAX_STAGE_CONCURRENCY") {
            if let Ok(v) = val.parse() {
                config.max_stage_concurrency = v;
            }
        }
        if let Ok(val) = std::env::var("CRUCIBLE_DEFAULT_STEP_TIMEOUT_SECS") {
            if let Ok(v) = val.parse() {
                config.default_step_timeout = Duration::from_secs(v);
            }
        }
        if let Ok(val) = std::env::var("CRUCIBLE_HEARTBEAT_STALE_SECS") {
            if let Ok(v) = val.parse() {
                config.heartbeat_stale = Duration::from_secs(v);
            }
        }
        if let Ok(val) = std::env::var("CRUCIBLE_ORPHAN_GRACE_SECS") {
            if let Ok(v) = val.parse() {
                config.orphan_grace = Duration::from_secs(v);
            }
        }
        if let Ok(val) = std::env::var("CRUCIBLE_LEADER_POLL_SECS") {
            if let Ok(v) = val.parse() {
                config.leader_poll = Duration::from_secs(v);
            }
        }
        config.queue_enabled = env_flag("CRUCIBLE_QUEUE_ENABLED", config.queue_enabled);
        config.distributed_dispatch =
            env_flag("CRUCIBLE_DISTRIBUTED_DISPATCH", config.distributed_dispatch);
        config.fallback_local = env_flag("CRUCIBLE_FALLBACK_LOCAL", config.fallback_local);
        config.dedup_enabled = env_flag("CRUCIBLE_DEDUP_ENABLED", config.dedup_enabled);
        if let Ok(val) = std::env::var("CRUCIBLE_DEDUP_WINDOW_SECS") {
            if let Ok(v) = val.parse() {
                config.dedup_window = Duration::from_secs(v);
            }
        }
        config.incremental_artifacts =
            env_flag("CRUCIBLE_INCREMENTAL_ARTIFACTS", config.incremental_artifacts);
        if let Ok(val) = std::env::var("CRUCIBLE_EVENT_TTL_DAYS") {
            if let Ok(v) = val.parse() {
                config.event_ttl_days = v;
            }
        }
        if let Ok(val) = std::env::var("CRUCIBLE_CACHE_MAX_AGE_DAYS") {
            if let Ok(v) = val.parse() {
                config.cache_max_age_days = v;
            }
        }
        if let Ok(val) = std::env::var("CRUCIBLE_CACHE_MAX_TOTAL_BYTES") {
            if let Ok(v) = val.parse() {
                config.cache_max_total_bytes = v;
            }
        }
        if let Ok(val) = std::env::var("CRUCIBLE_LISTEN_ADDR") {
            config.listen_addr = val;
        }

        config
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SystemConfig::default();
        assert_eq!(config.max_local_builds, 4);
        assert_eq!(config.max_stage_concurrency, 4);
        assert!(config.fallback_local);
        assert!(!config.distributed_dispatch);
    }
}
