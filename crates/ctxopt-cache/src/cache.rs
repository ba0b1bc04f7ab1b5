use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;

use ctxopt_core::model::{Manifest, ManifestId, ManifestMeta};
use ctxopt_core::storage::ManifestTable;
use ctxopt_core::CoreError;

use crate::error::CacheError;
use crate::generator::{GeneratedManifest, ManifestGenerator};
use crate::hasher;

/// A cache read: the manifest plus whether it matched its sources when read.
#[derive(Debug, Clone)]
pub struct CachedManifest {
    pub manifest: Arc<Manifest>,
    pub fresh: bool,
}

/// Result of trying to commit a regeneration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Installed, but a source first seen in the generator's output changed
    /// while it ran. The entry stays stale so the next read regenerates.
    CommittedStale,
    /// A newer invalidation changed a source after the regeneration hashed
    /// it, or a later regeneration or insert already committed.
    Superseded,
}

/// A regeneration still running after `regen_timeout * REGEN_GRACE` is
/// abandoned: its slot is freed and its result can no longer commit over a
/// newer one.
pub const REGEN_GRACE: u32 = 4;

#[derive(Debug, Default)]
struct CacheEntry {
    /// Last valid content; kept while stale so it can still be served.
    manifest: Option<Arc<Manifest>>,
    stale: bool,
    /// Bumped whenever an invalidation brings a new target hash.
    epoch: u64,
    /// Target hash per path from invalidations since the last commit.
    pending: BTreeMap<String, Option<String>>,
    /// Ticket of the regeneration or insert that produced `manifest`.
    ticket: u64,
}

struct Inflight {
    done: watch::Receiver<bool>,
    started: Instant,
}

struct CacheInner {
    root: PathBuf,
    generator: Arc<dyn ManifestGenerator>,
    entries: DashMap<ManifestId, Arc<RwLock<CacheEntry>>>,
    by_file: DashMap<String, BTreeSet<ManifestId>>,
    inflight: DashMap<ManifestId, Inflight>,
    /// Paths invalidated while any regeneration was running, with when.
    touched: DashMap<String, Instant>,
    tickets: AtomicU64,
    table: Option<ManifestTable>,
    regen_timeout: Duration,
}

/// Manifest cache with hash-based staleness and bounded regeneration.
///
/// Cheap to clone; clones share state. Reads take a per-entry read lock, so
/// readers of one manifest never wait on writers of another. Regenerations
/// run on tokio's blocking pool and outlive the callers that started them.
#[derive(Clone)]
pub struct ManifestCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for ManifestCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestCache")
            .field("root", &self.inner.root)
            .field("entries", &self.inner.entries.len())
            .field("persistent", &self.inner.table.is_some())
            .finish()
    }
}

impl ManifestCache {
    /// In-memory cache rooted at `root` (the directory source paths are
    /// relative to).
    pub fn new(
        root: impl Into<PathBuf>,
        generator: Arc<dyn ManifestGenerator>,
        regen_timeout: Duration,
    ) -> Self {
        Self::build(root.into(), generator, regen_timeout, None)
    }

    /// Cache backed by a persisted manifest table. Loads every stored
    /// manifest with its staleness flag.
    pub fn with_table(
        root: impl Into<PathBuf>,
        generator: Arc<dyn ManifestGenerator>,
        regen_timeout: Duration,
        table: ManifestTable,
    ) -> Result<Self, CoreError> {
        let loaded = table.load_all()?;
        let cache = Self::build(root.into(), generator, regen_timeout, Some(table));
        let count = loaded.len();
        for (manifest, stale) in loaded {
            cache.inner.load_entry(manifest, stale);
        }
        tracing::debug!(count, "Loaded persisted manifests");
        Ok(cache)
    }

    fn build(
        root: PathBuf,
        generator: Arc<dyn ManifestGenerator>,
        regen_timeout: Duration,
        table: Option<ManifestTable>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                root,
                generator,
                entries: DashMap::new(),
                by_file: DashMap::new(),
                inflight: DashMap::new(),
                touched: DashMap::new(),
                tickets: AtomicU64::new(0),
                table,
                regen_timeout,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn regen_timeout(&self) -> Duration {
        self.inner.regen_timeout
    }

    /// Whatever is cached for `id`, without triggering regeneration.
    pub fn peek(&self, id: &ManifestId) -> Option<CachedManifest> {
        let entry = self.inner.entries.get(id)?.value().clone();
        let e = entry.read();
        e.manifest.as_ref().map(|m| CachedManifest {
            manifest: Arc::clone(m),
            fresh: !e.stale,
        })
    }

    /// Fresh manifest, regenerating if needed within the configured timeout.
    pub async fn get(&self, id: &ManifestId) -> Option<CachedManifest> {
        self.get_within(id, self.inner.regen_timeout).await
    }

    /// Like [`get`](Self::get) with an explicit wait bound.
    ///
    /// On timeout or failure the last valid content is returned with
    /// `fresh = false`; a miss with nothing to fall back on yields `None`.
    /// The regeneration keeps running after a timeout.
    pub async fn get_within(&self, id: &ManifestId, timeout: Duration) -> Option<CachedManifest> {
        if let Some(hit) = self.peek(id) {
            if hit.fresh {
                return Some(hit);
            }
        }

        let mut done = self.inner.spawn_regeneration(id);
        let waited = tokio::time::timeout(timeout, done.wait_for(|finished| *finished))
            .await
            .map(|r| r.map(|_| ()));
        match waited {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                tracing::warn!(manifest_id = %id, "Regeneration ended without reporting");
            }
            Err(_) => {
                tracing::warn!(
                    manifest_id = %id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Regeneration timed out; serving last valid content"
                );
            }
        }
        self.peek(id)
    }

    /// Mark every manifest built from `path` stale. Returns the affected ids.
    ///
    /// The file's current hash becomes the target a pending regeneration
    /// must match to commit. Repeating an invalidation is a no-op.
    pub fn invalidate(&self, path: &str) -> Result<Vec<ManifestId>, CacheError> {
        let rel = hasher::normalize_path(&self.inner.root, path)?;
        // A running generator may be about to declare this path as a new source
        if !self.inner.inflight.is_empty() {
            self.inner.touched.insert(rel.clone(), Instant::now());
        }
        let ids: Vec<ManifestId> = self
            .inner
            .by_file
            .get(&rel)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        if ids.is_empty() {
            tracing::debug!(path = %rel, "No manifest depends on path");
            return Ok(ids);
        }

        let target = hasher::hash_file(&self.inner.root, &rel);
        for id in &ids {
            self.inner.mark_stale(id, &rel, target.clone());
        }
        tracing::info!(path = %rel, affected = ids.len(), "Invalidated manifests");
        Ok(ids)
    }

    /// Register generated content directly, hashing its sources now.
    pub fn insert(
        &self,
        id: ManifestId,
        generated: GeneratedManifest,
    ) -> Result<Arc<Manifest>, CacheError> {
        let root = &self.inner.root;
        let sources = hasher::normalize_all(root, &generated.source_files);
        let hashes = hasher::hash_all(root, &sources);
        let manifest = Arc::new(Manifest::new(
            id,
            generated.content,
            generated.domain_tags,
            sources,
            hashes,
        ));

        let entry = self.inner.entry(&manifest.id);
        let previous = {
            let mut e = entry.write();
            if let Some(table) = &self.inner.table {
                table.save(&manifest, false)?;
            }
            let previous = e
                .manifest
                .replace(Arc::clone(&manifest))
                .map(|m| m.source_files.clone())
                .unwrap_or_default();
            e.stale = false;
            e.pending.clear();
            e.ticket = self.inner.next_ticket();
            previous
        };
        self.inner
            .reindex(&manifest.id, &previous, &manifest.source_files);
        tracing::info!(
            manifest_id = %manifest.id,
            size_bytes = manifest.size_bytes,
            "Inserted manifest"
        );
        Ok(manifest)
    }

    /// Re-hash every manifest's sources and mark drifted ones stale.
    /// Returns the ids found stale, sorted.
    pub fn reconcile(&self) -> Vec<ManifestId> {
        let snapshot: Vec<Arc<Manifest>> = self
            .inner
            .entries
            .iter()
            .filter_map(|kv| kv.value().read().manifest.clone())
            .collect();

        let mut drifted = Vec::new();
        for manifest in snapshot {
            let current = hasher::hash_all(&self.inner.root, &manifest.source_files);
            if !manifest.is_stale_against(&current) {
                continue;
            }
            for (path, now) in current {
                if manifest.hash_set.get(&path) != Some(&now) {
                    self.inner.mark_stale(&manifest.id, &path, now);
                }
            }
            drifted.push(manifest.id.clone());
        }
        drifted.sort();
        if !drifted.is_empty() {
            tracing::info!(count = drifted.len(), "Reconcile found stale manifests");
        }
        drifted
    }

    /// Metadata of every cached manifest, sorted by id.
    pub fn list(&self) -> Vec<ManifestMeta> {
        let mut rows: Vec<ManifestMeta> = self
            .inner
            .entries
            .iter()
            .filter_map(|kv| {
                let e = kv.value().read();
                e.manifest.as_ref().map(|m| {
                    let mut meta = m.metadata();
                    meta.stale = e.stale;
                    meta
                })
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheInner {
    fn entry(&self, id: &ManifestId) -> Arc<RwLock<CacheEntry>> {
        self.entries.entry(id.clone()).or_default().value().clone()
    }

    fn next_ticket(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn touched_since(&self, path: &str, started: Instant) -> bool {
        self.touched
            .get(path)
            .map(|at| *at.value() >= started)
            .unwrap_or(false)
    }

    /// Drop touch records no running regeneration can still need.
    fn prune_touched(&self) {
        let now = Instant::now();
        let cutoff = self
            .inflight
            .iter()
            .map(|kv| kv.value().started)
            .min()
            .unwrap_or(now);
        self.touched.retain(|_, at| *at >= cutoff);
    }

    fn load_entry(&self, manifest: Manifest, stale: bool) {
        let id = manifest.id.clone();
        let sources = manifest.source_files.clone();
        let entry = CacheEntry {
            manifest: Some(Arc::new(manifest)),
            stale,
            ..Default::default()
        };
        self.entries.insert(id.clone(), Arc::new(RwLock::new(entry)));
        self.reindex(&id, &BTreeSet::new(), &sources);
    }

    fn reindex(&self, id: &ManifestId, old: &BTreeSet<String>, new: &BTreeSet<String>) {
        for path in old.difference(new) {
            if let Some(mut ids) = self.by_file.get_mut(path) {
                ids.remove(id);
            }
            self.by_file.remove_if(path, |_, ids| ids.is_empty());
        }
        for path in new.difference(old) {
            self.by_file.entry(path.clone()).or_default().insert(id.clone());
        }
    }

    fn mark_stale(&self, id: &ManifestId, path: &str, target: Option<String>) {
        let Some(entry) = self.entries.get(id).map(|kv| kv.value().clone()) else {
            return;
        };
        let mut e = entry.write();
        if e.pending.get(path) != Some(&target) {
            e.pending.insert(path.to_string(), target);
            e.epoch += 1;
        }
        if !e.stale {
            e.stale = true;
            if let Some(table) = &self.table {
                if let Err(err) = table.mark_stale(std::slice::from_ref(id)) {
                    tracing::error!(manifest_id = %id, "Failed to persist staleness: {err}");
                }
            }
        }
    }

    /// Start a regeneration for `id` unless one is already running, and
    /// return a receiver that flips to `true` when it finishes or is
    /// abandoned.
    fn spawn_regeneration(self: &Arc<Self>, id: &ManifestId) -> watch::Receiver<bool> {
        match self.inflight.entry(id.clone()) {
            Entry::Occupied(running) => running.get().done.clone(),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(false);
                let started = Instant::now();
                let ticket = self.next_ticket();
                slot.insert(Inflight {
                    done: rx.clone(),
                    started,
                });

                let inner = Arc::clone(self);
                let id = id.clone();
                tokio::spawn(async move {
                    let job = {
                        let inner = Arc::clone(&inner);
                        let id = id.clone();
                        tokio::task::spawn_blocking(move || inner.regenerate(&id, ticket, started))
                    };
                    let limit = inner.regen_timeout * REGEN_GRACE;
                    match tokio::time::timeout(limit, job).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            tracing::error!(manifest_id = %id, "Regeneration task panicked: {e}");
                        }
                        Err(_) => {
                            tracing::warn!(
                                manifest_id = %id,
                                limit_ms = limit.as_millis() as u64,
                                "Regeneration abandoned; the next read starts a new one"
                            );
                        }
                    }
                    inner.inflight.remove(&id);
                    inner.prune_touched();
                    let _ = tx.send(true);
                });
                rx
            }
        }
    }

    /// Generate, hash and commit. Runs on a blocking worker.
    fn regenerate(&self, id: &ManifestId, ticket: u64, started: Instant) -> Option<CommitOutcome> {
        let wall = SystemTime::now();
        let entry = self.entry(id);
        let (snapshot, prior_sources) = {
            let e = entry.read();
            let sources = e
                .manifest
                .as_ref()
                .map(|m| m.source_files.clone())
                .unwrap_or_default();
            (e.epoch, sources)
        };

        // Hash known sources before generating: an edit racing the generator
        // then leaves the recorded hash older than the content, never newer.
        let mut hashes = hasher::hash_all(&self.root, &prior_sources);
        let generated = match self.generator.generate(id) {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!(manifest_id = %id, "Regeneration failed: {e}");
                return None;
            }
        };
        let sources = hasher::normalize_all(&self.root, &generated.source_files);
        hashes.retain(|path, _| sources.contains(path));

        // Sources first declared by this run could only be hashed afterwards.
        // One written or invalidated since the run began gets no hash.
        let mut racing = Vec::new();
        for path in &sources {
            if hashes.contains_key(path) {
                continue;
            }
            let hash = hasher::hash_file(&self.root, path);
            if self.touched_since(path, started) || hasher::modified_since(&self.root, path, wall) {
                racing.push(path.clone());
                hashes.insert(path.clone(), None);
            } else {
                hashes.insert(path.clone(), hash);
            }
        }
        if !racing.is_empty() {
            tracing::info!(
                manifest_id = %id,
                paths = ?racing,
                "Sources changed during generation; result committed stale"
            );
        }

        let manifest = Manifest::new(
            id.clone(),
            generated.content,
            generated.domain_tags,
            sources,
            hashes,
        );
        let outcome = self.commit(manifest, snapshot, ticket, !racing.is_empty());
        tracing::debug!(
            manifest_id = %id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ?outcome,
            "Regeneration finished"
        );
        Some(outcome)
    }

    /// Install a regenerated manifest unless an invalidation that arrived
    /// after `snapshot` names a hash the regeneration did not see, or a
    /// newer ticket already committed.
    fn commit(&self, manifest: Manifest, snapshot: u64, ticket: u64, stale: bool) -> CommitOutcome {
        let entry = self.entry(&manifest.id);
        let manifest = Arc::new(manifest);
        let previous = {
            let mut e = entry.write();
            if ticket < e.ticket {
                tracing::info!(
                    manifest_id = %manifest.id,
                    "Regeneration finished after a newer commit; result discarded"
                );
                return CommitOutcome::Superseded;
            }
            if e.epoch != snapshot {
                let superseded = e.pending.iter().any(|(path, target)| {
                    manifest.source_files.contains(path) && manifest.hash_set.get(path) != Some(target)
                });
                if superseded {
                    e.stale = true;
                    tracing::info!(
                        manifest_id = %manifest.id,
                        "Regeneration superseded by newer invalidation; entry stays stale"
                    );
                    return CommitOutcome::Superseded;
                }
            }
            if let Some(table) = &self.table {
                if let Err(err) = table.save(&manifest, stale) {
                    tracing::error!(manifest_id = %manifest.id, "Failed to persist manifest: {err}");
                }
            }
            let previous = e
                .manifest
                .replace(Arc::clone(&manifest))
                .map(|m| m.source_files.clone())
                .unwrap_or_default();
            e.stale = stale;
            e.pending.clear();
            e.ticket = ticket;
            previous
        };
        self.reindex(&manifest.id, &previous, &manifest.source_files);
        if stale {
            CommitOutcome::CommittedStale
        } else {
            CommitOutcome::Committed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerateError;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const CARD: &str = "src/card.tsx";

    struct FileGenerator {
        root: PathBuf,
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl FileGenerator {
        fn new(root: &Path, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                root: root.to_path_buf(),
                calls: AtomicUsize::new(0),
                delay,
                fail: false,
            })
        }

        fn failing(root: &Path) -> Arc<Self> {
            Arc::new(Self {
                root: root.to_path_buf(),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ManifestGenerator for FileGenerator {
        fn generate(&self, _id: &ManifestId) -> Result<GeneratedManifest, GenerateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(GenerateError::Failed("boom".into()));
            }
            let text = fs::read_to_string(self.root.join(CARD))?;
            Ok(card_manifest(&text))
        }
    }

    /// Reads the card, then waits before returning. The first call can
    /// rewrite the card while it waits.
    struct ReadThenWait {
        root: PathBuf,
        calls: AtomicUsize,
        wait: Duration,
        edit: Option<&'static str>,
    }

    impl ReadThenWait {
        fn new(root: &Path, wait: Duration, edit: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                root: root.to_path_buf(),
                calls: AtomicUsize::new(0),
                wait,
                edit,
            })
        }
    }

    impl ManifestGenerator for ReadThenWait {
        fn generate(&self, _id: &ManifestId) -> Result<GeneratedManifest, GenerateError> {
            let first = self.calls.fetch_add(1, Ordering::SeqCst) == 0;
            let text = fs::read_to_string(self.root.join(CARD))?;
            std::thread::sleep(self.wait);
            if let (true, Some(edit)) = (first, self.edit) {
                fs::write(self.root.join(CARD), edit)?;
            }
            Ok(card_manifest(&text))
        }
    }

    /// The first call blocks for `stuck` and then returns "late"; later calls
    /// return the card promptly.
    struct StuckOnce {
        root: PathBuf,
        calls: AtomicUsize,
        stuck: Duration,
    }

    impl ManifestGenerator for StuckOnce {
        fn generate(&self, _id: &ManifestId) -> Result<GeneratedManifest, GenerateError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::thread::sleep(self.stuck);
                return Ok(card_manifest("late"));
            }
            let text = fs::read_to_string(self.root.join(CARD))?;
            Ok(card_manifest(&text))
        }
    }

    fn card_manifest(text: &str) -> GeneratedManifest {
        GeneratedManifest {
            content: serde_json::json!({ "text": text }),
            source_files: [CARD.to_string()].into_iter().collect(),
            domain_tags: ["frontend".to_string()].into_iter().collect(),
        }
    }

    fn workspace(text: &str) -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        fs::write(tmp.path().join(CARD), text).unwrap();
        tmp
    }

    fn id() -> ManifestId {
        ManifestId::from("component-manifest")
    }

    fn text_of(hit: &CachedManifest) -> String {
        hit.manifest.content["text"].as_str().unwrap().to_string()
    }

    fn epoch_of(cache: &ManifestCache, id: &ManifestId) -> u64 {
        cache.inner.entries.get(id).unwrap().read().epoch
    }

    #[tokio::test]
    async fn test_miss_generates_then_hits() {
        let tmp = workspace("v1");
        let gen = FileGenerator::new(tmp.path(), Duration::ZERO);
        let cache = ManifestCache::new(tmp.path(), gen.clone(), Duration::from_secs(2));

        let hit = cache.get(&id()).await.unwrap();
        assert!(hit.fresh);
        assert_eq!(text_of(&hit), "v1");
        assert!(hit.manifest.hash_set[CARD].is_some());

        cache.get(&id()).await.unwrap();
        assert_eq!(gen.calls(), 1);
    }

    #[tokio::test]
    async fn test_miss_with_failing_generator_is_none() {
        let tmp = workspace("v1");
        let cache = ManifestCache::new(
            tmp.path(),
            FileGenerator::failing(tmp.path()),
            Duration::from_secs(2),
        );
        assert!(cache.get(&id()).await.is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_failed_regeneration_serves_stale_copy() {
        let tmp = workspace("v1");
        let cache = ManifestCache::new(
            tmp.path(),
            FileGenerator::failing(tmp.path()),
            Duration::from_secs(2),
        );
        cache.insert(id(), card_manifest("v1")).unwrap();
        fs::write(tmp.path().join(CARD), "v2").unwrap();
        cache.invalidate(CARD).unwrap();

        let hit = cache.get(&id()).await.unwrap();
        assert!(!hit.fresh);
        assert_eq!(text_of(&hit), "v1");
    }

    #[tokio::test]
    async fn test_invalidate_then_get_regenerates() {
        let tmp = workspace("v1");
        let gen = FileGenerator::new(tmp.path(), Duration::ZERO);
        let cache = ManifestCache::new(tmp.path(), gen.clone(), Duration::from_secs(2));
        cache.get(&id()).await.unwrap();

        fs::write(tmp.path().join(CARD), "v2").unwrap();
        let abs = tmp.path().join(CARD);
        let affected = cache.invalidate(abs.to_str().unwrap()).unwrap();
        assert_eq!(affected, vec![id()]);
        assert!(!cache.peek(&id()).unwrap().fresh);

        let hit = cache.get(&id()).await.unwrap();
        assert!(hit.fresh);
        assert_eq!(text_of(&hit), "v2");
        assert_eq!(gen.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let tmp = workspace("v1");
        let gen = FileGenerator::new(tmp.path(), Duration::ZERO);
        let cache = ManifestCache::new(tmp.path(), gen, Duration::from_secs(2));
        cache.insert(id(), card_manifest("v1")).unwrap();

        fs::write(tmp.path().join(CARD), "v2").unwrap();
        let first = cache.invalidate(CARD).unwrap();
        let epoch = epoch_of(&cache, &id());
        let second = cache.invalidate(CARD).unwrap();
        assert_eq!(first, second);
        assert_eq!(epoch_of(&cache, &id()), epoch);
        assert!(!cache.peek(&id()).unwrap().fresh);
    }

    #[tokio::test]
    async fn test_invalidate_unrelated_path() {
        let tmp = workspace("v1");
        let cache = ManifestCache::new(
            tmp.path(),
            FileGenerator::new(tmp.path(), Duration::ZERO),
            Duration::from_secs(2),
        );
        cache.insert(id(), card_manifest("v1")).unwrap();
        assert!(cache.invalidate("README.md").unwrap().is_empty());
        assert!(cache.peek(&id()).unwrap().fresh);
        assert!(cache.invalidate("../outside").is_err());
    }

    #[test]
    fn test_commit_discarded_when_newer_invalidation_disagrees() {
        let tmp = workspace("v1");
        let cache = ManifestCache::new(
            tmp.path(),
            FileGenerator::new(tmp.path(), Duration::ZERO),
            Duration::from_secs(2),
        );
        cache.insert(id(), card_manifest("v1")).unwrap();
        let path = tmp.path().join(CARD);

        fs::write(&path, "v2").unwrap();
        cache.invalidate(CARD).unwrap();
        let h2 = hasher::hash_file(tmp.path(), CARD);

        // A regeneration starts and records v2...
        let snapshot = epoch_of(&cache, &id());
        let regenerated = |text: &str, hash: Option<String>| {
            let g = card_manifest(text);
            Manifest::new(
                id(),
                g.content,
                g.domain_tags,
                g.source_files,
                [(CARD.to_string(), hash)].into_iter().collect(),
            )
        };

        // ...while the file moves on to v3.
        fs::write(&path, "v3").unwrap();
        cache.invalidate(CARD).unwrap();
        let h3 = hasher::hash_file(tmp.path(), CARD);

        let outcome = cache.inner.commit(regenerated("v2", h2), snapshot, cache.inner.next_ticket(), false);
        assert_eq!(outcome, CommitOutcome::Superseded);
        let hit = cache.peek(&id()).unwrap();
        assert!(!hit.fresh);
        assert_eq!(text_of(&hit), "v1");

        let snapshot = epoch_of(&cache, &id());
        let outcome = cache.inner.commit(regenerated("v3", h3), snapshot, cache.inner.next_ticket(), false);
        assert_eq!(outcome, CommitOutcome::Committed);
        let hit = cache.peek(&id()).unwrap();
        assert!(hit.fresh);
        assert_eq!(text_of(&hit), "v3");
    }

    #[test]
    fn test_commit_kept_when_late_invalidation_matches() {
        let tmp = workspace("v1");
        let cache = ManifestCache::new(
            tmp.path(),
            FileGenerator::new(tmp.path(), Duration::ZERO),
            Duration::from_secs(2),
        );
        cache.insert(id(), card_manifest("v1")).unwrap();
        let snapshot = epoch_of(&cache, &id());

        // The regeneration already saw v2; the notification for it arrives late
        fs::write(tmp.path().join(CARD), "v2").unwrap();
        let h2 = hasher::hash_file(tmp.path(), CARD);
        cache.invalidate(CARD).unwrap();
        assert_ne!(epoch_of(&cache, &id()), snapshot);

        let g = card_manifest("v2");
        let manifest = Manifest::new(
            id(),
            g.content,
            g.domain_tags,
            g.source_files,
            [(CARD.to_string(), h2)].into_iter().collect(),
        );
        let ticket = cache.inner.next_ticket();
        assert_eq!(
            cache.inner.commit(manifest, snapshot, ticket, false),
            CommitOutcome::Committed
        );
        assert!(cache.peek(&id()).unwrap().fresh);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_serves_stale_and_regeneration_still_lands() {
        let tmp = workspace("v1");
        let gen = FileGenerator::new(tmp.path(), Duration::from_millis(200));
        let cache = ManifestCache::new(tmp.path(), gen.clone(), Duration::from_secs(2));
        cache.insert(id(), card_manifest("v1")).unwrap();
        fs::write(tmp.path().join(CARD), "v2").unwrap();
        cache.invalidate(CARD).unwrap();

        let hit = cache
            .get_within(&id(), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!hit.fresh);
        assert_eq!(text_of(&hit), "v1");

        let mut warmed = false;
        for _ in 0..300 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if cache.peek(&id()).map(|h| h.fresh).unwrap_or(false) {
                warmed = true;
                break;
            }
        }
        assert!(warmed);
        assert_eq!(text_of(&cache.peek(&id()).unwrap()), "v2");
        assert_eq!(gen.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_caller_does_not_cancel_regeneration() {
        let tmp = workspace("v1");
        let gen = FileGenerator::new(tmp.path(), Duration::from_millis(150));
        let cache = ManifestCache::new(tmp.path(), gen.clone(), Duration::from_secs(5));

        let caller = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(&id()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        caller.abort();

        let mut warmed = false;
        for _ in 0..300 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if cache.peek(&id()).is_some() {
                warmed = true;
                break;
            }
        }
        assert!(warmed);
        assert_eq!(gen.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gets_share_one_regeneration() {
        let tmp = workspace("v1");
        let gen = FileGenerator::new(tmp.path(), Duration::from_millis(100));
        let cache = ManifestCache::new(tmp.path(), gen.clone(), Duration::from_secs(5));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get(&id()).await })
            })
            .collect();
        for h in handles {
            let hit = h.await.unwrap().unwrap();
            assert!(hit.fresh);
        }
        assert_eq!(gen.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_source_edited_during_first_generation_commits_stale() {
        let tmp = workspace("v1");
        let gen = ReadThenWait::new(tmp.path(), Duration::from_millis(50), Some("v2"));
        let cache = ManifestCache::new(tmp.path(), gen.clone(), Duration::from_secs(2));

        let hit = cache.get(&id()).await.unwrap();
        assert_eq!(text_of(&hit), "v1");
        assert!(!hit.fresh);
        assert_eq!(hit.manifest.hash_set[CARD], None);
        assert_eq!(cache.reconcile(), vec![id()]);

        let hit = cache.get(&id()).await.unwrap();
        assert!(hit.fresh);
        assert_eq!(text_of(&hit), "v2");
        assert_eq!(gen.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalidation_during_first_generation_commits_stale() {
        let tmp = workspace("v1");
        let gen = ReadThenWait::new(tmp.path(), Duration::from_millis(300), None);
        let cache = ManifestCache::new(tmp.path(), gen, Duration::from_secs(2));

        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(&id()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Edit with an mtime from the past, so only the notification tells
        let path = tmp.path().join(CARD);
        fs::write(&path, "v2").unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
        assert!(cache.invalidate(CARD).unwrap().is_empty());

        let hit = pending.await.unwrap().unwrap();
        assert_eq!(text_of(&hit), "v1");
        assert!(!hit.fresh);

        let hit = cache.get(&id()).await.unwrap();
        assert!(hit.fresh);
        assert_eq!(text_of(&hit), "v2");
        assert!(cache.inner.touched.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hung_generator_is_abandoned_and_cannot_commit_late() {
        let tmp = workspace("v1");
        let gen = Arc::new(StuckOnce {
            root: tmp.path().to_path_buf(),
            calls: AtomicUsize::new(0),
            stuck: Duration::from_millis(700),
        });
        let cache = ManifestCache::new(tmp.path(), gen.clone(), Duration::from_millis(50));

        assert!(cache.get(&id()).await.is_none());

        let mut freed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if cache.inner.inflight.is_empty() {
                freed = true;
                break;
            }
        }
        assert!(freed);

        let hit = cache.get(&id()).await.unwrap();
        assert!(hit.fresh);
        assert_eq!(text_of(&hit), "v1");

        // The stuck call returns eventually; its result is older than the commit
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(text_of(&cache.peek(&id()).unwrap()), "v1");
        assert_eq!(gen.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reconcile_detects_unnotified_edits() {
        let tmp = workspace("v1");
        let cache = ManifestCache::new(
            tmp.path(),
            FileGenerator::new(tmp.path(), Duration::ZERO),
            Duration::from_secs(2),
        );
        cache.insert(id(), card_manifest("v1")).unwrap();
        assert!(cache.reconcile().is_empty());

        fs::remove_file(tmp.path().join(CARD)).unwrap();
        assert_eq!(cache.reconcile(), vec![id()]);
        assert!(!cache.peek(&id()).unwrap().fresh);
    }

    #[test]
    fn test_insert_hashes_missing_sources_as_none() {
        let tmp = workspace("v1");
        let cache = ManifestCache::new(
            tmp.path(),
            FileGenerator::new(tmp.path(), Duration::ZERO),
            Duration::from_secs(2),
        );
        let mut g = card_manifest("v1");
        g.source_files.insert("./src/gone.ts".to_string());
        let m = cache.insert(id(), g).unwrap();
        assert!(m.source_files.contains("src/gone.ts"));
        assert_eq!(m.hash_set["src/gone.ts"], None);
        assert_eq!(cache.list().len(), 1);
    }

    #[test]
    fn test_persisted_state_survives_reopen() {
        let tmp = workspace("v1");
        let table = || {
            ManifestTable::new(
                tmp.path().join("state/manifests.json"),
                tmp.path().join("state/content"),
            )
        };
        let gen = FileGenerator::new(tmp.path(), Duration::ZERO);

        let cache =
            ManifestCache::with_table(tmp.path(), gen.clone(), Duration::from_secs(2), table())
                .unwrap();
        cache.insert(id(), card_manifest("v1")).unwrap();
        fs::write(tmp.path().join(CARD), "v2").unwrap();
        cache.invalidate(CARD).unwrap();

        let reopened =
            ManifestCache::with_table(tmp.path(), gen, Duration::from_secs(2), table()).unwrap();
        let hit = reopened.peek(&id()).unwrap();
        assert!(!hit.fresh);
        assert_eq!(text_of(&hit), "v1");
        assert_eq!(reopened.invalidate(CARD).unwrap(), vec![id()]);
    }
}
