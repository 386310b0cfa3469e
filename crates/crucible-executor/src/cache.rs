//! Stage-result fingerprints and the artifact/dependency cache.
//!
//! Cache trees live under `<cache_root>/<entry_id>/<path_index>/`; restore
//! copies them back into the workspace. Saves are immutable: the store's
//! first-write-wins insert decides whether the tree is kept.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use sha2::{Digest, Sha256};

use crucible_core::cache::CacheEntry;
use crucible_core::pipeline::CacheDecl;
use crucible_core::store::CacheStore;
use crucible_core::{Error, ResourceId, Result};

use crate::workspace::confine;

/// Environment keys that vary per build and must not feed the stage
/// fingerprint.
const VOLATILE_ENV: &[&str] = &[
    "CRUCIBLE_BUILD_ID",
    "CRUCIBLE_BUILD_NUMBER",
    "CRUCIBLE_WORKSPACE",
    "CRUCIBLE_JOB_NAME",
];

/// Streaming SHA-256 of a file, 8 KiB at a time.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| Error::CacheIo(format!("open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::CacheIo(format!("read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Fingerprint identifying an idempotent stage execution:
/// SHA-256 over `git_commit | stage_name | sorted(commands) | sorted(stable_env)`.
pub fn stage_fingerprint(
    git_commit: &str,
    stage_name: &str,
    commands: &[String],
    env: &HashMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(git_commit.as_bytes());
    hasher.update(b"|");
    hasher.update(stage_name.as_bytes());
    hasher.update(b"|");
    let mut commands: Vec<&String> = commands.iter().collect();
    commands.sort();
    for command in commands {
        hasher.update(command.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"|");
    let mut stable: Vec<(&String, &String)> = env
        .iter()
        .filter(|(key, _)| !VOLATILE_ENV.contains(&key.as_str()))
        .collect();
    stable.sort();
    for (key, value) in stable {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

static HASH_FILES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"hashFiles\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).unwrap());

/// Resolve `hashFiles(<glob>)` directives in a cache key against the
/// workspace. Matched files are hashed in sorted path order.
pub fn resolve_cache_key(key: &str, workspace: &Path) -> Result<String> {
    let mut failure: Option<Error> = None;
    let resolved = HASH_FILES_RE.replace_all(key, |caps: &regex::Captures<'_>| {
        match hash_matching_files(&caps[1], workspace) {
            Ok(digest) => digest,
            Err(e) => {
                failure.get_or_insert(e);
                String::new()
            }
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(resolved.into_owned()),
    }
}

fn hash_matching_files(pattern: &str, workspace: &Path) -> Result<String> {
    // Confinement before globbing: the pattern must stay inside the
    // workspace.
    confine(workspace, pattern)?;
    let full = workspace.join(pattern);
    let full = full
        .to_str()
        .ok_or_else(|| Error::CacheIo("non-utf8 workspace path".into()))?;
    let mut paths: Vec<PathBuf> = glob::glob(full)
        .map_err(|e| Error::CacheIo(format!("bad glob {pattern}: {e}")))?
        .filter_map(|entry| entry.ok())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    let mut hasher = Sha256::new();
    for path in paths {
        hasher.update(hash_file(&path)?.as_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Filesystem side of the artifact/dependency cache.
#[derive(Debug, Clone)]
pub struct DirCache {
    root: PathBuf,
}

impl DirCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_dir(&self, entry_id: ResourceId) -> PathBuf {
        self.root.join(entry_id.to_string())
    }

    /// Copy the declared paths out of the workspace into a new cache tree.
    /// Returns the total size in bytes.
    pub fn save(
        &self,
        entry_id: ResourceId,
        workspace: &Path,
        paths: &[String],
    ) -> Result<i64> {
        let dir = self.entry_dir(entry_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::CacheIo(format!("create {}: {e}", dir.display())))?;
        let mut total = 0;
        for (index, rel) in paths.iter().enumerate() {
            let source = confine(workspace, rel)?;
            if !source.exists() {
                continue;
            }
            let target = dir.join(index.to_string());
            total += copy_tree(&source, &target)?;
        }
        Ok(total)
    }

    /// Copy a cache tree back into the workspace at the declared paths.
    pub fn restore(&self, entry: &CacheEntry, workspace: &Path) -> Result<()> {
        let dir = self.entry_dir(entry.id);
        for (index, rel) in entry.paths.iter().enumerate() {
            let source = dir.join(index.to_string());
            if !source.exists() {
                continue;
            }
            let target = confine(workspace, rel)?;
            if target.exists() {
                if target.is_dir() {
                    std::fs::remove_dir_all(&target)
                        .map_err(|e| Error::CacheIo(format!("clear {}: {e}", target.display())))?;
                } else {
                    std::fs::remove_file(&target)
                        .map_err(|e| Error::CacheIo(format!("clear {}: {e}", target.display())))?;
                }
            }
            copy_tree(&source, &target)?;
        }
        Ok(())
    }

    /// Remove an evicted entry's tree.
    pub fn remove(&self, entry_id: ResourceId) -> Result<()> {
        let dir = self.entry_dir(entry_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::CacheIo(format!("remove {}: {e}", dir.display()))),
        }
    }
}

fn copy_tree(source: &Path, target: &Path) -> Result<i64> {
    let mut total = 0;
    if source.is_dir() {
        std::fs::create_dir_all(target)
            .map_err(|e| Error::CacheIo(format!("create {}: {e}", target.display())))?;
        for entry in std::fs::read_dir(source)
            .map_err(|e| Error::CacheIo(format!("read {}: {e}", source.display())))?
        {
            let entry = entry.map_err(|e| Error::CacheIo(e.to_string()))?;
            total += copy_tree(&entry.path(), &target.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::CacheIo(format!("create {}: {e}", parent.display())))?;
        }
        let bytes = std::fs::copy(source, target)
            .map_err(|e| Error::CacheIo(format!("copy {}: {e}", source.display())))?;
        total += bytes as i64;
    }
    Ok(total)
}

/// Restore order: exact key first, then each restore-key prefix in declared
/// order (most recent entry wins per prefix). Returns the matched entry.
pub async fn restore_declared(
    store: &dyn CacheStore,
    dir_cache: &DirCache,
    org_id: ResourceId,
    job_id: ResourceId,
    decl: &CacheDecl,
    resolved_key: &str,
    workspace: &Path,
) -> Result<Option<CacheEntry>> {
    let exact = store.find_exact(org_id, job_id, resolved_key).await?;
    let entry = match exact {
        Some(entry) => Some(entry),
        None => {
            let mut found = None;
            for prefix in &decl.restore_keys {
                if let Some(entry) = store.find_latest_with_prefix(org_id, job_id, prefix).await? {
                    found = Some(entry);
                    break;
                }
            }
            found
        }
    };
    if let Some(entry) = &entry {
        dir_cache.restore(entry, workspace)?;
        store.record_hit(entry.id).await?;
    }
    Ok(entry)
}

/// Save the declared paths under the resolved key. A duplicate key keeps the
/// existing entry and discards the new tree.
pub async fn save_declared(
    store: &dyn CacheStore,
    dir_cache: &DirCache,
    org_id: ResourceId,
    job_id: ResourceId,
    decl: &CacheDecl,
    resolved_key: &str,
    workspace: &Path,
) -> Result<()> {
    let entry_id = ResourceId::new();
    let size = dir_cache.save(entry_id, workspace, &decl.paths)?;
    let entry = CacheEntry {
        id: entry_id,
        org_id,
        job_id,
        cache_key: resolved_key.to_string(),
        paths: decl.paths.clone(),
        size_bytes: size,
        hit_count: 0,
        created_at: Utc::now(),
    };
    if !store.insert(&entry).await? {
        dir_cache.remove(entry_id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_byte_file_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(
            hash_file(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn fingerprint_is_deterministic_and_input_sensitive() {
        let env = HashMap::from([
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("CRUCIBLE_BUILD_ID".to_string(), "b-1".to_string()),
        ]);
        let commands = vec!["make".to_string()];
        let a = stage_fingerprint("abc123", "Build", &commands, &env);
        let b = stage_fingerprint("abc123", "Build", &commands, &env);
        assert_eq!(a, b);

        // Volatile env does not change the fingerprint.
        let mut env2 = env.clone();
        env2.insert("CRUCIBLE_BUILD_ID".to_string(), "b-2".to_string());
        assert_eq!(a, stage_fingerprint("abc123", "Build", &commands, &env2));

        // Commit, stage name, commands and stable env all do.
        assert_ne!(a, stage_fingerprint("def456", "Build", &commands, &env));
        assert_ne!(a, stage_fingerprint("abc123", "Test", &commands, &env));
        assert_ne!(a, stage_fingerprint("abc123", "Build", &["make all".to_string()], &env));
        let mut env3 = env.clone();
        env3.insert("PATH".to_string(), "/bin".to_string());
        assert_ne!(a, stage_fingerprint("abc123", "Build", &commands, &env3));
    }

    #[test]
    fn fingerprint_ignores_command_order() {
        let env = HashMap::new();
        let a = stage_fingerprint("c", "S", &["a".into(), "b".into()], &env);
        let b = stage_fingerprint("c", "S", &["b".into(), "a".into()], &env);
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_hash_files_directive() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("Cargo.lock"), "[[package]]").unwrap();
        let key = resolve_cache_key("deps-hashFiles('Cargo.lock')", ws.path()).unwrap();
        assert!(key.starts_with("deps-"));
        assert_eq!(key.len(), "deps-".len() + 64);

        // Same contents, same key.
        let again = resolve_cache_key("deps-hashFiles('Cargo.lock')", ws.path()).unwrap();
        assert_eq!(key, again);

        // Changed contents, different key.
        std::fs::write(ws.path().join("Cargo.lock"), "[[package]] changed").unwrap();
        let changed = resolve_cache_key("deps-hashFiles('Cargo.lock')", ws.path()).unwrap();
        assert_ne!(key, changed);
    }

    #[test]
    fn save_and_restore_roundtrip() {
        let ws = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(ws.path().join("node_modules/pkg")).unwrap();
        std::fs::write(ws.path().join("node_modules/pkg/index.js"), "module.exports = 1;").unwrap();

        let dir_cache = DirCache::new(cache_root.path());
        let entry_id = ResourceId::new();
        let size = dir_cache
            .save(entry_id, ws.path(), &["node_modules".to_string()])
            .unwrap();
        assert!(size > 0);

        // Wipe and restore.
        std::fs::remove_dir_all(ws.path().join("node_modules")).unwrap();
        let entry = CacheEntry {
            id: entry_id,
            org_id: ResourceId::new(),
            job_id: ResourceId::new(),
            cache_key: "k".into(),
            paths: vec!["node_modules".to_string()],
            size_bytes: size,
            hit_count: 0,
            created_at: Utc::now(),
        };
        dir_cache.restore(&entry, ws.path()).unwrap();
        let restored = std::fs::read_to_string(ws.path().join("node_modules/pkg/index.js")).unwrap();
        assert_eq!(restored, "module.exports = 1;");
    }
}
