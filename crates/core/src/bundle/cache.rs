//! Content-addressed bundle cache.
//!
//! Cache keys are `slug@version#checksum`, so a republished bundle with
//! different bytes never collides with a cached directory. Entries are
//! ref-counted; eviction (TTL, then LRU over capacity) only ever
//! touches directories with no live references.

use crate::bundle::archive;
use crate::bundle::manifest::BundleManifest;
use crate::error::{Error, Result};
use crate::storage::artifacts::ArtifactStore;
use crate::types::JobBundleVersion;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct BundleCacheConfig {
    pub root: PathBuf,
    pub max_entries: usize,
    pub ttl: Duration,
}

impl BundleCacheConfig {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            max_entries: 32,
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

struct CacheEntry {
    directory: PathBuf,
    entry_file: PathBuf,
    manifest: BundleManifest,
    ref_count: usize,
    last_accessed: Instant,
}

type LoadOutcome = Option<std::result::Result<(), String>>;

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    pending: HashMap<String, watch::Receiver<LoadOutcome>>,
}

/// Materializes bundle artifacts on local disk and hands out
/// ref-counted directories.
pub struct BundleCache {
    config: BundleCacheConfig,
    artifacts: Arc<dyn ArtifactStore>,
    state: Mutex<CacheState>,
}

impl BundleCache {
    pub fn new(config: BundleCacheConfig, artifacts: Arc<dyn ArtifactStore>) -> Result<Self> {
        std::fs::create_dir_all(&config.root)?;
        std::fs::create_dir_all(config.root.join("__staging"))?;
        std::fs::create_dir_all(config.root.join("__downloads"))?;
        Ok(Self {
            config,
            artifacts,
            state: Mutex::new(CacheState::default()),
        })
    }

    pub fn cache_key(version: &JobBundleVersion) -> String {
        format!(
            "{}@{}#{}",
            version.bundle_slug, version.version, version.checksum
        )
    }

    fn entry_dir_name(version: &JobBundleVersion) -> String {
        let short = &version.checksum[..version.checksum.len().min(12)];
        format!("{}@{}-{}", version.bundle_slug, version.version, short)
    }

    /// Acquire a materialized bundle directory. Concurrent acquisitions
    /// of the same key coalesce into one load.
    pub async fn acquire(self: &Arc<Self>, version: &JobBundleVersion) -> Result<AcquiredBundle> {
        let key = Self::cache_key(version);

        loop {
            enum Action {
                Ready(AcquiredBundle),
                Wait(watch::Receiver<LoadOutcome>),
                Load(watch::Sender<LoadOutcome>),
            }

            let action = {
                let mut state = self.state.lock().unwrap();
                if let Some(entry) = state.entries.get_mut(&key) {
                    if entry.directory.exists() {
                        entry.ref_count += 1;
                        entry.last_accessed = Instant::now();
                        Action::Ready(AcquiredBundle {
                            key: key.clone(),
                            directory: entry.directory.clone(),
                            entry_file: entry.entry_file.clone(),
                            manifest: entry.manifest.clone(),
                            cache: self.clone(),
                            released: false,
                        })
                    } else {
                        // The directory vanished under us; reload.
                        state.entries.remove(&key);
                        let (tx, rx) = watch::channel(None);
                        state.pending.insert(key.clone(), rx);
                        Action::Load(tx)
                    }
                } else if let Some(rx) = state.pending.get(&key) {
                    Action::Wait(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    state.pending.insert(key.clone(), rx);
                    Action::Load(tx)
                }
            };

            match action {
                Action::Ready(bundle) => return Ok(bundle),
                Action::Wait(mut rx) => {
                    // One in-flight load per key; wait for its outcome
                    // and retry against the fresh entry map.
                    loop {
                        if let Some(outcome) = rx.borrow_and_update().clone() {
                            outcome.map_err(|reason| Error::BundleResolution {
                                binding: key.clone(),
                                reason,
                            })?;
                            break;
                        }
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                    continue;
                }
                Action::Load(tx) => {
                    // If this future is dropped mid-load the pending
                    // entry must still come out, or waiters would spin
                    // on a channel that never resolves.
                    let mut cleanup = PendingCleanup {
                        cache: self.as_ref(),
                        key: key.clone(),
                        armed: true,
                    };
                    let loaded = self.load(version, &key).await;
                    cleanup.armed = false;
                    drop(cleanup);
                    let mut state = self.state.lock().unwrap();
                    state.pending.remove(&key);
                    match loaded {
                        Ok(entry) => {
                            let bundle = AcquiredBundle {
                                key: key.clone(),
                                directory: entry.directory.clone(),
                                entry_file: entry.entry_file.clone(),
                                manifest: entry.manifest.clone(),
                                cache: self.clone(),
                                released: false,
                            };
                            state.entries.insert(key.clone(), entry);
                            let _ = tx.send(Some(Ok(())));
                            return Ok(bundle);
                        }
                        Err(e) => {
                            let _ = tx.send(Some(Err(e.to_string())));
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    async fn load(&self, version: &JobBundleVersion, key: &str) -> Result<CacheEntry> {
        tracing::info!(bundle = %key, "materializing bundle artifact");

        let bytes = self.artifacts.fetch(version).await?;

        let actual = archive::checksum(&bytes);
        if actual != version.checksum {
            return Err(Error::ChecksumMismatch {
                key: key.to_string(),
                expected: version.checksum.clone(),
                actual,
            });
        }

        let target = self.config.root.join(Self::entry_dir_name(version));
        let staging = archive::staging_dir(&self.config.root, &Self::entry_dir_name(version));

        let extract_bytes = bytes.to_vec();
        let extract_staging = staging.clone();
        tokio::task::spawn_blocking(move || archive::extract_archive(&extract_bytes, &extract_staging))
            .await
            .map_err(|e| Error::store(e.to_string()))??;

        // Atomically replace the target; a concurrent rename losing the
        // race is benign since contents are content-addressed.
        if target.exists() {
            std::fs::remove_dir_all(&staging)?;
        } else {
            match std::fs::rename(&staging, &target) {
                Ok(()) => {}
                Err(e) if target.exists() => {
                    tracing::debug!(bundle = %key, "lost rename race: {e}");
                    std::fs::remove_dir_all(&staging).ok();
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }

        let manifest = archive::read_manifest(&target)?;
        let entry_file = self.resolve_entry_file(&target, &manifest.entry)?;

        Ok(CacheEntry {
            directory: target,
            entry_file,
            manifest,
            ref_count: 1,
            last_accessed: Instant::now(),
        })
    }

    /// Resolve the manifest entry inside the cache root, guarding
    /// against traversal out of the bundle directory.
    fn resolve_entry_file(&self, dir: &Path, entry: &str) -> Result<PathBuf> {
        let candidate = dir.join(entry);
        let canonical = candidate.canonicalize().map_err(|e| {
            Error::validation(format!("bundle entry file '{entry}' is missing: {e}"))
        })?;
        let root = self
            .config
            .root
            .canonicalize()
            .map_err(Error::Io)?;
        if !canonical.starts_with(&root) {
            return Err(Error::validation(format!(
                "bundle entry file '{entry}' resolves outside the cache root"
            )));
        }
        Ok(canonical)
    }

    fn release(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.last_accessed = Instant::now();
        }
        self.evict_locked(&mut state);
    }

    fn evict_locked(&self, state: &mut CacheState) {
        let now = Instant::now();
        let ttl = self.config.ttl;

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.ref_count == 0 && now.duration_since(e.last_accessed) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = state.entries.remove(&key) {
                tracing::debug!(bundle = %key, "evicting expired bundle");
                std::fs::remove_dir_all(&entry.directory).ok();
            }
        }

        while state.entries.len() > self.config.max_entries {
            let lru = state
                .entries
                .iter()
                .filter(|(_, e)| e.ref_count == 0)
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone());
            match lru {
                Some(key) => {
                    if let Some(entry) = state.entries.remove(&key) {
                        tracing::debug!(bundle = %key, "evicting bundle over capacity");
                        std::fs::remove_dir_all(&entry.directory).ok();
                    }
                }
                // Everything left is ref-held; nothing evictable.
                None => break,
            }
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    #[cfg(test)]
    fn ref_count(&self, key: &str) -> Option<usize> {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(key)
            .map(|e| e.ref_count)
    }
}

/// Removes an in-flight load marker if the loading future is dropped
/// before completing.
struct PendingCleanup<'a> {
    cache: &'a BundleCache,
    key: String,
    armed: bool,
}

impl Drop for PendingCleanup<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache
                .state
                .lock()
                .unwrap()
                .pending
                .remove(&self.key);
        }
    }
}

/// A ref-held, materialized bundle directory.
pub struct AcquiredBundle {
    key: String,
    directory: PathBuf,
    entry_file: PathBuf,
    manifest: BundleManifest,
    cache: Arc<BundleCache>,
    released: bool,
}

impl std::fmt::Debug for AcquiredBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredBundle")
            .field("key", &self.key)
            .field("directory", &self.directory)
            .field("entry_file", &self.entry_file)
            .field("manifest", &self.manifest)
            .field("released", &self.released)
            .finish()
    }
}

impl AcquiredBundle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn entry_file(&self) -> &Path {
        &self.entry_file
    }

    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    /// Drop the reference and run eviction.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.cache.release(&self.key);
        }
    }
}

impl Drop for AcquiredBundle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::artifacts::FilesystemArtifactStore;
    use crate::types::{BundleArtifactStorage, BundleVersionStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    fn make_artifact(storage_root: &Path, slug: &str, version: u32) -> JobBundleVersion {
        let bundle_src = TempDir::new().unwrap();
        std::fs::write(
            bundle_src.path().join("manifest.json"),
            serde_json::to_string(&BundleManifest {
                name: slug.to_string(),
                version: format!("{version}.0.0"),
                entry: "index.js".to_string(),
                capabilities: vec!["network".to_string()],
                metadata: None,
            })
            .unwrap(),
        )
        .unwrap();
        std::fs::write(
            bundle_src.path().join("index.js"),
            "module.exports.handler = async () => ({ ok: true });",
        )
        .unwrap();

        let bytes = archive::pack_directory(bundle_src.path()).unwrap();
        let checksum = archive::checksum(&bytes);
        let artifact_path = format!("{slug}/{version}.tgz");
        std::fs::create_dir_all(storage_root.join(slug)).unwrap();
        std::fs::write(storage_root.join(&artifact_path), &bytes).unwrap();

        JobBundleVersion {
            bundle_slug: slug.to_string(),
            version,
            manifest: BundleManifest {
                name: slug.to_string(),
                version: format!("{version}.0.0"),
                entry: "index.js".to_string(),
                capabilities: vec!["network".to_string()],
                metadata: None,
            },
            checksum,
            artifact_storage: BundleArtifactStorage::Local,
            artifact_path,
            immutable: true,
            status: BundleVersionStatus::Published,
            published_at: Utc::now(),
        }
    }

    fn cache_with_storage() -> (TempDir, TempDir, Arc<BundleCache>) {
        let storage = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let artifacts =
            Arc::new(FilesystemArtifactStore::new(storage.path().to_path_buf()).unwrap());
        let cache = Arc::new(
            BundleCache::new(
                BundleCacheConfig::new(cache_dir.path().to_path_buf()),
                artifacts,
            )
            .unwrap(),
        );
        (storage, cache_dir, cache)
    }

    #[tokio::test]
    async fn acquire_materializes_and_shares_directory() {
        let (storage, _cache_dir, cache) = cache_with_storage();
        let version = make_artifact(storage.path(), "reporting", 1);

        let first = cache.acquire(&version).await.unwrap();
        let second = cache.acquire(&version).await.unwrap();

        assert_eq!(first.directory(), second.directory());
        assert!(first.entry_file().exists());
        assert_eq!(first.manifest().entry, "index.js");
        assert_eq!(cache.ref_count(first.key()), Some(2));

        let key = first.key().to_string();
        first.release();
        assert_eq!(cache.ref_count(&key), Some(1));
        second.release();
        assert_eq!(cache.ref_count(&key), Some(0));
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_before_extraction() {
        let (storage, _cache_dir, cache) = cache_with_storage();
        let mut version = make_artifact(storage.path(), "reporting", 1);
        version.checksum = "00".repeat(32);

        let err = cache.acquire(&version).await.unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn lru_eviction_skips_ref_held_directories() {
        let storage = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let artifacts =
            Arc::new(FilesystemArtifactStore::new(storage.path().to_path_buf()).unwrap());
        let mut config = BundleCacheConfig::new(cache_dir.path().to_path_buf());
        config.max_entries = 1;
        let cache = Arc::new(BundleCache::new(config, artifacts).unwrap());

        let v1 = make_artifact(storage.path(), "alpha", 1);
        let v2 = make_artifact(storage.path(), "beta", 1);

        let held = cache.acquire(&v1).await.unwrap();
        let second = cache.acquire(&v2).await.unwrap();
        let held_dir = held.directory().to_path_buf();

        // Releasing beta brings the cache over capacity; alpha is
        // ref-held so beta (the only evictable entry) goes.
        second.release();
        assert!(held_dir.exists());
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.ref_count(held.key()), Some(1));

        held.release();
    }

    #[tokio::test]
    async fn concurrent_acquires_coalesce_into_one_load() {
        let (storage, _cache_dir, cache) = cache_with_storage();
        let version = make_artifact(storage.path(), "reporting", 2);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let version = version.clone();
                tokio::spawn(async move { cache.acquire(&version).await })
            })
            .collect();

        let mut dirs = Vec::new();
        for task in tasks {
            let bundle = task.await.unwrap().unwrap();
            dirs.push(bundle.directory().to_path_buf());
            bundle.release();
        }
        dirs.dedup();
        assert_eq!(dirs.len(), 1);
        assert_eq!(cache.entry_count(), 1);
    }
}
