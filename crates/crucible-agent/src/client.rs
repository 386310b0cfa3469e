//! Outbound HTTP client for the master.

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::json;

use crucible_core::agent::SystemInfo;
use crucible_core::build::{BuildStatus, StageRecord, StepRecord};
use crucible_core::event::BuildEvent;
use crucible_core::{Error, ResourceId, Result};

pub struct MasterClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl MasterClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::DispatchFailed(format!("{path}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::DispatchFailed(format!("{path}: status {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| Error::DispatchFailed(format!("{path}: {e}")))
    }

    pub async fn register(
        &self,
        name: &str,
        url: &str,
        labels: &BTreeSet<String>,
        max_builds: u32,
        system_info: &SystemInfo,
    ) -> Result<ResourceId> {
        let body = json!({
            "name": name,
            "url": url,
            "labels": labels,
            "max_builds": max_builds,
            "system_info": system_info,
        });
        let response = self.post_json("/api/agents/register", body).await?;
        response["agent_id"]
            .as_str()
            .ok_or_else(|| Error::DispatchFailed("register response missing agent_id".into()))?
            .parse()
            .map_err(|e| Error::DispatchFailed(format!("register response: {e}")))
    }

    pub async fn heartbeat(
        &self,
        agent_id: ResourceId,
        current_builds: u32,
        system_info: &SystemInfo,
    ) -> Result<()> {
        self.post_json(
            &format!("/api/agents/{agent_id}/heartbeat"),
            json!({ "current_builds": current_builds, "system_info": system_info }),
        )
        .await
        .map(|_| ())
    }

    pub async fn post_event(&self, event: &BuildEvent) -> Result<()> {
        self.post_json(
            &format!("/api/builds/{}/agent-events", event.build_id),
            serde_json::to_value(event).map_err(|e| Error::Internal(e.to_string()))?,
        )
        .await
        .map(|_| ())
    }

    /// Submit the final status along with the stage/step records produced
    /// on this agent, so the master's audit trail matches local builds.
    pub async fn post_result(
        &self,
        build_id: ResourceId,
        status: BuildStatus,
        error: Option<&str>,
        stages: &[StageRecord],
        steps: &[StepRecord],
    ) -> Result<()> {
        self.post_json(
            &format!("/api/builds/{build_id}/result"),
            json!({
                "status": status.as_str(),
                "error": error,
                "stage_results": { "stages": stages, "steps": steps },
            }),
        )
        .await
        .map(|_| ())
    }

    /// Multipart upload of collected artifact files.
    pub async fn upload_artifacts(
        &self,
        build_id: ResourceId,
        files: &[(String, std::path::PathBuf)],
    ) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let mut form = reqwest::multipart::Form::new();
        for (filename, path) in files {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| Error::ArtifactIo(format!("read {}: {e}", path.display())))?;
            form = form.part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(filename.clone()),
            );
        }
        let path = format!("/api/builds/{build_id}/artifacts");
        let response = self
            .client
            .post(self.url(&path))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::ArtifactIo(format!("{path}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::ArtifactIo(format!("{path}: status {}", response.status())));
        }
        Ok(())
    }
}

/// Best-effort local telemetry for registration and heartbeats.
pub fn local_system_info() -> SystemInfo {
    SystemInfo {
        cpu_cores: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        memory_gb: read_memory_gb().unwrap_or(0),
        os: Some(std::env::consts::OS.to_string()),
        arch: Some(std::env::consts::ARCH.to_string()),
    }
}

fn read_memory_gb() -> Option<u32> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some((kb / (1024 * 1024)) as u32)
}
