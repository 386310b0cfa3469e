//! Artifact collection and incremental block deltas.
//!
//! Glob patterns match files in the workspace; each match is copied into the
//! artifact root and recorded with its SHA-256. With incremental artifacts
//! enabled, a 4 KiB block delta against the previous build's artifact of the
//! same filename is stored instead when it saves more than 20%.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crucible_core::artifact::ArtifactRecord;
use crucible_core::build::Build;
use crucible_core::store::ArtifactStore;
use crucible_core::{Error, ResourceId, Result};

use crate::cache::hash_file;

/// Block size for incremental deltas.
pub const DELTA_BLOCK: usize = 4096;

/// Minimum relative saving before a delta is stored instead of the full
/// file.
const MIN_DELTA_SAVING: f64 = 0.20;

/// A block-level delta against a base artifact. Handles files longer than
/// the base: blocks past `base_len` are always carried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDelta {
    pub base_len: u64,
    pub total_len: u64,
    pub block_size: u32,
    pub blocks: Vec<DeltaBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaBlock {
    pub index: u32,
    pub data_b64: String,
}

/// Compute the blocks of `new` that differ from `base`.
pub fn compute_delta(base: &[u8], new: &[u8]) -> BlockDelta {
    let mut blocks = Vec::new();
    for (index, chunk) in new.chunks(DELTA_BLOCK).enumerate() {
        let offset = index * DELTA_BLOCK;
        let base_chunk = if offset < base.len() {
            &base[offset..(offset + chunk.len()).min(base.len())]
        } else {
            &[]
        };
        if base_chunk != chunk {
            blocks.push(DeltaBlock {
                index: index as u32,
                data_b64: BASE64.encode(chunk),
            });
        }
    }
    BlockDelta {
        base_len: base.len() as u64,
        total_len: new.len() as u64,
        block_size: DELTA_BLOCK as u32,
        blocks,
    }
}

/// Reconstruct the original bytes from a base and a delta.
pub fn apply_delta(base: &[u8], delta: &BlockDelta) -> Result<Vec<u8>> {
    if delta.base_len != base.len() as u64 {
        return Err(Error::ArtifactIo(format!(
            "delta base length mismatch: expected {}, have {}",
            delta.base_len,
            base.len()
        )));
    }
    let block_size = delta.block_size as usize;
    let mut out = vec![0u8; delta.total_len as usize];

    // Start from the base, truncated or zero-extended to the new length.
    let carry = base.len().min(out.len());
    out[..carry].copy_from_slice(&base[..carry]);

    for block in &delta.blocks {
        let offset = block.index as usize * block_size;
        let data = BASE64
            .decode(&block.data_b64)
            .map_err(|e| Error::ArtifactIo(format!("corrupt delta block: {e}")))?;
        if offset + data.len() > out.len() {
            return Err(Error::ArtifactIo("delta block beyond total length".into()));
        }
        out[offset..offset + data.len()].copy_from_slice(&data);
    }
    Ok(out)
}

fn content_type_for(filename: &str) -> &'static str {
    match Path::new(filename).extension().and_then(|e| e.to_str()) {
        Some("txt" | "log" | "md") => "text/plain",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("html") => "text/html",
        Some("tar") => "application/x-tar",
        Some("gz" | "tgz") => "application/gzip",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Collector for one build's artifacts.
pub struct ArtifactCollector {
    root: PathBuf,
    incremental: bool,
}

impl ArtifactCollector {
    pub fn new(root: impl Into<PathBuf>, incremental: bool) -> Self {
        Self {
            root: root.into(),
            incremental,
        }
    }

    /// Match the patterns against the workspace and persist every file.
    /// Individual file failures are recorded and skipped so one bad path
    /// does not lose the rest.
    pub async fn collect(
        &self,
        store: &dyn ArtifactStore,
        build: &Build,
        workspace: &Path,
        patterns: &[String],
    ) -> Result<Vec<ArtifactRecord>> {
        let mut records = Vec::new();
        for pattern in patterns {
            crate::workspace::confine(workspace, pattern)?;
            let full = workspace.join(pattern);
            let full = full
                .to_str()
                .ok_or_else(|| Error::ArtifactIo("non-utf8 workspace path".into()))?;
            let matches = glob::glob(full)
                .map_err(|e| Error::ArtifactIo(format!("bad artifact glob {pattern}: {e}")))?;
            for path in matches.filter_map(|m| m.ok()).filter(|p| p.is_file()) {
                match self.store_file(store, build, workspace, &path).await {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warn!(build_id = %build.id, path = %path.display(), error = %e,
                              "artifact collection failed for file");
                    }
                }
            }
        }
        Ok(records)
    }

    async fn store_file(
        &self,
        store: &dyn ArtifactStore,
        build: &Build,
        workspace: &Path,
        path: &Path,
    ) -> Result<ArtifactRecord> {
        let filename = path
            .strip_prefix(workspace)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();
        let bytes = std::fs::read(path)
            .map_err(|e| Error::ArtifactIo(format!("read {}: {e}", path.display())))?;
        let sha256 = hash_file(path)?;
        let id = ResourceId::new();

        let build_dir = self.root.join(build.id.to_string());
        std::fs::create_dir_all(&build_dir)
            .map_err(|e| Error::ArtifactIo(format!("create {}: {e}", build_dir.display())))?;

        let mut record = ArtifactRecord {
            id,
            build_id: build.id,
            org_id: build.org_id,
            filename: filename.clone(),
            path: String::new(),
            size_bytes: bytes.len() as i64,
            content_type: content_type_for(&filename).to_string(),
            sha256,
            delta_base_id: None,
            is_delta: false,
            original_size_bytes: None,
            created_at: Utc::now(),
        };

        if self.incremental {
            if let Some((base, base_bytes)) = self.previous_artifact(store, build, &filename).await {
                let delta = compute_delta(&base_bytes, &bytes);
                let encoded = serde_json::to_vec(&delta)
                    .map_err(|e| Error::ArtifactIo(format!("encode delta: {e}")))?;
                let saving = 1.0 - encoded.len() as f64 / bytes.len().max(1) as f64;
                if saving > MIN_DELTA_SAVING {
                    debug!(build_id = %build.id, filename, saving, "storing artifact as delta");
                    let target = build_dir.join(format!("{id}.delta"));
                    std::fs::write(&target, encoded)
                        .map_err(|e| Error::ArtifactIo(format!("write {}: {e}", target.display())))?;
                    record.path = target.display().to_string();
                    record.is_delta = true;
                    record.delta_base_id = Some(base.id);
                    record.original_size_bytes = Some(bytes.len() as i64);
                    record.size_bytes = std::fs::metadata(&target)
                        .map(|m| m.len() as i64)
                        .unwrap_or(record.size_bytes);
                    store.insert(&record).await?;
                    return Ok(record);
                }
            }
        }

        let target = build_dir.join(id.to_string());
        std::fs::write(&target, &bytes)
            .map_err(|e| Error::ArtifactIo(format!("write {}: {e}", target.display())))?;
        record.path = target.display().to_string();
        store.insert(&record).await?;
        Ok(record)
    }

    async fn previous_artifact(
        &self,
        store: &dyn ArtifactStore,
        build: &Build,
        filename: &str,
    ) -> Option<(ArtifactRecord, Vec<u8>)> {
        let base = store
            .find_latest_for_job(build.org_id, build.job_id, filename, build.id)
            .await
            .ok()
            .flatten()?;
        // Delta-of-delta chains are not worth the reconstruction cost; only
        // full artifacts serve as bases.
        if base.is_delta {
            return None;
        }
        let bytes = std::fs::read(&base.path).ok()?;
        Some((base, bytes))
    }

    /// Read an artifact's bytes back, reconstructing deltas. A pruned base
    /// fails with `artifact-io`.
    pub async fn materialize(
        &self,
        store: &dyn ArtifactStore,
        record: &ArtifactRecord,
    ) -> Result<Vec<u8>> {
        let bytes = std::fs::read(&record.path)
            .map_err(|e| Error::ArtifactIo(format!("read {}: {e}", record.path)))?;
        if !record.is_delta {
            return Ok(bytes);
        }
        let base_id = record
            .delta_base_id
            .ok_or_else(|| Error::ArtifactIo("delta artifact without base id".into()))?;
        let base = store
            .get(base_id)
            .await?
            .ok_or_else(|| Error::ArtifactIo(format!("delta base {base_id} pruned")))?;
        let base_bytes = std::fs::read(&base.path)
            .map_err(|e| Error::ArtifactIo(format!("delta base {}: {e}", base.path)))?;
        let delta: BlockDelta = serde_json::from_slice(&bytes)
            .map_err(|e| Error::ArtifactIo(format!("corrupt delta: {e}")))?;
        apply_delta(&base_bytes, &delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::build::TriggerType;
    use crucible_db::memory::memory_stores;

    fn build_for(job: ResourceId, org: ResourceId) -> Build {
        Build::new(job, org, TriggerType::Manual, HashMap::new())
    }

    #[test]
    fn delta_roundtrip_identical_files() {
        let base = vec![1u8; DELTA_BLOCK * 3];
        let delta = compute_delta(&base, &base);
        assert!(delta.blocks.is_empty());
        assert_eq!(apply_delta(&base, &delta).unwrap(), base);
    }

    #[test]
    fn delta_roundtrip_changed_and_appended_blocks() {
        let base = vec![1u8; DELTA_BLOCK * 3];
        let mut new = base.clone();
        new[DELTA_BLOCK + 10] = 42;
        new.extend(vec![7u8; DELTA_BLOCK + 100]);

        let delta = compute_delta(&base, &new);
        // One changed block plus two appended ones.
        assert_eq!(delta.blocks.len(), 3);
        assert_eq!(apply_delta(&base, &delta).unwrap(), new);
    }

    #[test]
    fn delta_roundtrip_truncated_file() {
        let base = vec![5u8; DELTA_BLOCK * 4];
        let new = vec![5u8; DELTA_BLOCK + 17];
        let delta = compute_delta(&base, &new);
        assert_eq!(apply_delta(&base, &delta).unwrap(), new);
    }

    #[test]
    fn apply_rejects_wrong_base() {
        let base = vec![1u8; DELTA_BLOCK];
        let delta = compute_delta(&base, &base);
        let err = apply_delta(&[0u8; 10], &delta).unwrap_err();
        assert_eq!(err.kind(), "artifact-io");
    }

    #[tokio::test]
    async fn collects_zero_byte_file_with_valid_sha() {
        let stores = memory_stores();
        let workspace = tempfile::tempdir().unwrap();
        let artifact_root = tempfile::tempdir().unwrap();
        std::fs::write(workspace.path().join("empty.txt"), b"").unwrap();

        let build = build_for(ResourceId::new(), ResourceId::new());
        let collector = ArtifactCollector::new(artifact_root.path(), false);
        let records = collector
            .collect(&*stores.artifacts, &build, workspace.path(), &["*.txt".to_string()])
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].size_bytes, 0);
        assert_eq!(
            records[0].sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn incremental_stores_delta_and_materializes() {
        let stores = memory_stores();
        let org = ResourceId::new();
        let job = ResourceId::new();
        let workspace = tempfile::tempdir().unwrap();
        let artifact_root = tempfile::tempdir().unwrap();
        let collector = ArtifactCollector::new(artifact_root.path(), true);

        // First build stores the full file.
        let first = stores.builds.create(&build_for(job, org)).await.unwrap();
        let payload = vec![3u8; DELTA_BLOCK * 64];
        std::fs::write(workspace.path().join("app.bin"), &payload).unwrap();
        let records = collector
            .collect(&*stores.artifacts, &first, workspace.path(), &["app.bin".to_string()])
            .await
            .unwrap();
        assert!(!records[0].is_delta);

        // Second build with one changed block stores a delta.
        let second = stores.builds.create(&build_for(job, org)).await.unwrap();
        let mut changed = payload.clone();
        changed[0] = 9;
        std::fs::write(workspace.path().join("app.bin"), &changed).unwrap();
        let records = collector
            .collect(&*stores.artifacts, &second, workspace.path(), &["app.bin".to_string()])
            .await
            .unwrap();
        assert!(records[0].is_delta);
        assert_eq!(records[0].original_size_bytes, Some(changed.len() as i64));
        assert!(records[0].size_bytes < changed.len() as i64);

        let materialized = collector
            .materialize(&*stores.artifacts, &records[0])
            .await
            .unwrap();
        assert_eq!(materialized, changed);
    }

    #[tokio::test]
    async fn pruned_base_fails_with_artifact_io() {
        let stores = memory_stores();
        let org = ResourceId::new();
        let job = ResourceId::new();
        let workspace = tempfile::tempdir().unwrap();
        let artifact_root = tempfile::tempdir().unwrap();
        let collector = ArtifactCollector::new(artifact_root.path(), true);

        let first = stores.builds.create(&build_for(job, org)).await.unwrap();
        let payload = vec![3u8; DELTA_BLOCK * 64];
        std::fs::write(workspace.path().join("app.bin"), &payload).unwrap();
        let base_records = collector
            .collect(&*stores.artifacts, &first, workspace.path(), &["app.bin".to_string()])
            .await
            .unwrap();

        let second = stores.builds.create(&build_for(job, org)).await.unwrap();
        let mut changed = payload;
        changed[1] = 4;
        std::fs::write(workspace.path().join("app.bin"), &changed).unwrap();
        let records = collector
            .collect(&*stores.artifacts, &second, workspace.path(), &["app.bin".to_string()])
            .await
            .unwrap();
        assert!(records[0].is_delta);

        // Prune the base file from disk.
        std::fs::remove_file(&base_records[0].path).unwrap();
        let err = collector
            .materialize(&*stores.artifacts, &records[0])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "artifact-io");
    }
}
