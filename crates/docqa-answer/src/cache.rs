//! Answer cache with single-flight computation.
//!
//! Keys are blake3 digests over the normalized question, the retrieved
//! context and the routing choice, so a corpus edit that changes what is
//! retrieved also changes the key. Entries are additionally evicted when a
//! write touches one of their source documents or chunks. Finished answers
//! sit in a `moka` store bounded by `cache.max_entries`, with `cache.ttl_secs`
//! as its time to live, so expired and surplus entries are reclaimed without
//! being looked up again.
//!
//! At most one computation runs per key: the first caller installs a shared
//! future, later callers with the same key await that same future. The
//! in-flight slot is removed when the computation finishes, fails or is
//! dropped, so a failure is never cached and never blocks the next caller.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use moka::notification::RemovalCause;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use docqa_core::config::{expand_path, CacheSettings};
use docqa_core::traits::CorpusObserver;
use docqa_core::types::{ChunkId, DocumentId, Engine, RetrievalResult};
use docqa_core::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(
        question: &str,
        retrieval: &RetrievalResult,
        engine: Engine,
        model_id: &str,
        agent: Option<&str>,
    ) -> Self {
        let mut hits: Vec<_> = retrieval.hits.iter().map(|h| &h.chunk).collect();
        hits.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));

        let mut hasher = blake3::Hasher::new();
        let mut field = |bytes: &[u8]| {
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };
        field(normalize_question(question).as_bytes());
        for c in &hits {
            field(c.chunk_id.as_bytes());
        }
        // content fingerprint: same ids over edited text must not collide
        for c in &hits {
            field(blake3::hash(c.text.as_bytes()).as_bytes());
        }
        field(engine.as_str().as_bytes());
        field(model_id.as_bytes());
        field(agent.unwrap_or("").trim().to_ascii_lowercase().as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lowercase, collapse whitespace, drop trailing punctuation.
pub fn normalize_question(question: &str) -> String {
    let collapsed = question.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    collapsed.trim_end_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace()).to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub answer_text: String,
    pub source_chunk_ids: Vec<ChunkId>,
    pub source_document_ids: Vec<DocumentId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub mode_used: Engine,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }
}

/// What a compute step hands back to the cache.
#[derive(Debug, Clone)]
pub struct Computed {
    pub answer_text: String,
    pub engine: Engine,
    /// False for answers that must be returned but not remembered.
    pub cacheable: bool,
}

/// How a [`AnswerCache::get_or_compute`] call was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Hit,
    /// Waited on a computation started by another caller.
    Joined,
    Computed,
}

type SharedAnswer = Shared<BoxFuture<'static, Result<Arc<CacheEntry>>>>;

enum Lookup {
    Hit(Arc<CacheEntry>),
    Join(SharedAnswer),
    Compute(SharedAnswer),
}

struct InFlight {
    id: u64,
    task: WeakShared<BoxFuture<'static, Result<Arc<CacheEntry>>>>,
}

/// Bookkeeping for running computations. Finished answers live in the
/// bounded [`Entries`] store instead.
#[derive(Default)]
struct State {
    inflight: HashMap<CacheKey, InFlight>,
    epoch: u64,
    cleared_at: u64,
    /// Last invalidation epoch per document, kept only while some
    /// computation that could be made stale by it is still running.
    doc_epochs: HashMap<DocumentId, u64>,
}

impl State {
    fn stale_since(&self, start: u64, documents: &[DocumentId]) -> bool {
        self.cleared_at > start || documents.iter().any(|d| self.doc_epochs.get(d).is_some_and(|e| *e > start))
    }
}

type Entries = moka::sync::Cache<CacheKey, Arc<CacheEntry>>;

struct Inner {
    state: Mutex<State>,
    entries: Entries,
    dir: Option<PathBuf>,
    ttl: Option<Duration>,
    next_id: AtomicU64,
}

impl Inner {
    fn live(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            debug!(key = %key.as_str(), "cache entry expired");
            self.entries.invalidate(key);
            if let Some(dir) = &self.dir {
                remove_file(dir, key);
            }
            return None;
        }
        Some(entry)
    }

    fn evict(&self, pred: impl Fn(&CacheEntry) -> bool) -> usize {
        let doomed: Vec<Arc<CacheKey>> =
            self.entries.iter().filter_map(|(k, e)| pred(e.as_ref()).then_some(k)).collect();
        for key in &doomed {
            self.entries.invalidate(&**key);
            if let Some(dir) = &self.dir {
                remove_file(dir, key);
            }
        }
        doomed.len()
    }

    fn store(&self, entry: &Arc<CacheEntry>, epoch: u64) {
        let st = self.state.lock();
        if st.stale_since(epoch, &entry.source_document_ids) {
            debug!(key = %entry.key.as_str(), "corpus changed during computation, not caching");
            return;
        }
        if let Some(dir) = &self.dir {
            if let Err(e) = write_entry(dir, entry) {
                warn!(key = %entry.key.as_str(), error = %e, "failed to persist cache entry");
            }
        }
        self.entries.insert(entry.key.clone(), Arc::clone(entry));
    }
}

#[derive(Clone)]
pub struct AnswerCache {
    inner: Arc<Inner>,
}

impl AnswerCache {
    /// In-memory cache without expiry, bounded by the default capacity.
    pub fn in_memory() -> Self {
        Self::with_parts(None, &CacheSettings::default(), Vec::new())
    }

    /// Open the cache described by `settings`, reloading persisted entries
    /// when a directory is configured.
    pub fn open(settings: &CacheSettings) -> Result<Self> {
        let Some(dir) = settings.dir.as_deref().map(expand_path) else {
            return Ok(Self::with_parts(None, settings, Vec::new()));
        };
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::InvalidConfig(format!("cache dir {}: {e}", dir.display())))?;
        let entries = load_dir(&dir)?;
        info!(dir = %dir.display(), entries = entries.len(), "opened answer cache");
        Ok(Self::with_parts(Some(dir), settings, entries))
    }

    fn with_parts(dir: Option<PathBuf>, settings: &CacheSettings, loaded: Vec<CacheEntry>) -> Self {
        let ttl = settings.ttl_secs.map(Duration::from_secs);
        let mut builder = moka::sync::Cache::builder().max_capacity(settings.max_entries.max(1));
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }
        if let Some(dir) = dir.clone() {
            // expired or capacity-evicted answers take their file with them
            builder = builder.eviction_listener(move |key: Arc<CacheKey>, _, cause: RemovalCause| {
                if cause.was_evicted() {
                    remove_file(&dir, &key);
                }
            });
        }
        let entries: Entries = builder.build();
        for entry in loaded {
            entries.insert(entry.key.clone(), Arc::new(entry));
        }
        let inner = Inner { state: Mutex::new(State::default()), entries, dir, ttl, next_id: AtomicU64::new(0) };
        Self { inner: Arc::new(inner) }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.inner.live(key, Utc::now())
    }

    /// Serve `key` from the cache, join a computation already running for
    /// it, or run `compute` and remember its result.
    ///
    /// `compute` is not called on a hit or a join. The result is stored
    /// only when it is cacheable and none of `retrieval`'s documents changed
    /// while it was being computed.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &CacheKey,
        retrieval: &RetrievalResult,
        compute: F,
    ) -> Result<(Arc<CacheEntry>, Origin)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Computed>> + Send + 'static,
    {
        // `compute()` only builds a future, so it is safe to call under the lock;
        // checking and installing the slot in one critical section keeps two
        // misses from both computing.
        let lookup = {
            let mut st = self.inner.state.lock();
            if let Some(entry) = self.inner.live(key, Utc::now()) {
                Lookup::Hit(entry)
            } else if let Some(task) = st.inflight.get(key).and_then(|f| f.task.upgrade()) {
                Lookup::Join(task)
            } else {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let task = self.shared_compute(key.clone(), id, st.epoch, retrieval, compute());
                if let Some(weak) = task.downgrade() {
                    st.inflight.insert(key.clone(), InFlight { id, task: weak });
                }
                Lookup::Compute(task)
            }
        };
        match lookup {
            Lookup::Hit(entry) => Ok((entry, Origin::Hit)),
            Lookup::Join(task) => {
                debug!(key = %key.as_str(), "joining in-flight computation");
                task.await.map(|e| (e, Origin::Joined))
            }
            Lookup::Compute(task) => task.await.map(|e| (e, Origin::Computed)),
        }
    }

    fn shared_compute<Fut>(
        &self,
        key: CacheKey,
        id: u64,
        epoch: u64,
        retrieval: &RetrievalResult,
        compute: Fut,
    ) -> SharedAnswer
    where
        Fut: Future<Output = Result<Computed>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let source_chunk_ids = retrieval.sorted_chunk_ids();
        let source_document_ids = retrieval.document_ids();
        async move {
            let _slot = SlotGuard { inner: Arc::clone(&inner), key: key.clone(), id };
            let computed = compute.await?;
            let created_at = Utc::now();
            let expires_at = inner.ttl.and_then(|t| chrono::Duration::from_std(t).ok()).map(|t| created_at + t);
            let entry = Arc::new(CacheEntry {
                key,
                answer_text: computed.answer_text,
                source_chunk_ids,
                source_document_ids,
                created_at,
                expires_at,
                mode_used: computed.engine,
            });
            if computed.cacheable {
                inner.store(&entry, epoch);
            }
            Ok(entry)
        }
        .boxed()
        .shared()
    }

    /// Evict every entry grounded in `document_id`. Returns how many went.
    pub fn invalidate_document(&self, document_id: &str) -> usize {
        let mut st = self.inner.state.lock();
        st.epoch += 1;
        if !st.inflight.is_empty() {
            let epoch = st.epoch;
            st.doc_epochs.insert(document_id.to_string(), epoch);
        }
        let n = self.inner.evict(|e| e.source_document_ids.iter().any(|d| d == document_id));
        if n > 0 {
            info!(document_id, evicted = n, "invalidated cached answers");
        }
        n
    }

    /// Evict every entry citing one of `chunk_ids`.
    pub fn invalidate_chunks(&self, chunk_ids: &[ChunkId]) -> usize {
        if chunk_ids.is_empty() {
            return 0;
        }
        let ids: HashSet<&str> = chunk_ids.iter().map(String::as_str).collect();
        let _st = self.inner.state.lock();
        let n = self.inner.evict(|e| e.source_chunk_ids.iter().any(|c| ids.contains(c.as_str())));
        if n > 0 {
            debug!(evicted = n, "invalidated cached answers by chunk");
        }
        n
    }

    pub fn clear(&self) {
        let mut st = self.inner.state.lock();
        st.epoch += 1;
        st.cleared_at = st.epoch;
        st.doc_epochs.clear();
        let n = self.inner.evict(|_| true);
        info!(evicted = n, "cleared answer cache");
    }

    /// Live entries, after reclaiming expired and over-capacity ones.
    pub fn len(&self) -> usize {
        self.inner.entries.run_pending_tasks();
        usize::try_from(self.inner.entries.entry_count()).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Clears the in-flight slot however the computation ends, including when
/// every waiter is dropped.
struct SlotGuard {
    inner: Arc<Inner>,
    key: CacheKey,
    id: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut st = self.inner.state.lock();
        if st.inflight.get(&self.key).is_some_and(|f| f.id == self.id) {
            st.inflight.remove(&self.key);
        }
        if st.inflight.is_empty() {
            st.doc_epochs.clear();
        }
    }
}

impl CorpusObserver for AnswerCache {
    fn chunks_changed(&self, document_id: &str, chunk_ids: &[ChunkId]) {
        self.invalidate_document(document_id);
        self.invalidate_chunks(chunk_ids);
    }

    fn corpus_cleared(&self) {
        self.clear();
    }
}

fn entry_path(dir: &Path, key: &CacheKey) -> PathBuf {
    dir.join(format!("{}.json", key.as_str()))
}

fn write_entry(dir: &Path, entry: &CacheEntry) -> anyhow::Result<()> {
    let path = entry_path(dir, &entry.key);
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(entry)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

fn remove_file(dir: &Path, key: &CacheKey) {
    let path = entry_path(dir, key);
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove cache file"),
    }
}

/// Read every `<key>.json` under `dir`. Malformed or expired files are
/// deleted and skipped.
fn load_dir(dir: &Path) -> Result<Vec<CacheEntry>> {
    let read = std::fs::read_dir(dir).map_err(|e| Error::InvalidConfig(format!("cache dir {}: {e}", dir.display())))?;
    let now = Utc::now();
    let mut entries = Vec::new();
    for item in read.flatten() {
        let path = item.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string();
        match read_entry(&path, &stem) {
            Ok(entry) if entry.is_expired(now) => {
                debug!(key = %stem, "dropping expired cache file");
                let _ = std::fs::remove_file(&path);
            }
            Ok(entry) => {
                entries.push(entry);
            }
            Err(e) => {
                warn!(error = %e, "treating cache entry as a miss");
                let _ = std::fs::remove_file(&path);
            }
        }
    }
    Ok(entries)
}

fn read_entry(path: &Path, stem: &str) -> Result<CacheEntry> {
    let corrupt = |message: String| Error::CacheCorruption { key: stem.to_string(), message };
    let bytes = std::fs::read(path).map_err(|e| corrupt(e.to_string()))?;
    let entry: CacheEntry = serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
    if entry.key.as_str() != stem {
        return Err(corrupt(format!("file holds key {}", entry.key.as_str())));
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization() {
        assert_eq!(normalize_question("  What is   ENTROPY?? "), "what is entropy");
        assert_eq!(normalize_question("What is entropy"), "what is entropy");
    }

    #[test]
    fn key_depends_on_route_and_agent() {
        let r = RetrievalResult::empty();
        let base = CacheKey::new("What is entropy?", &r, Engine::Local, "mistral", None);
        assert_eq!(base, CacheKey::new("what is  entropy", &r, Engine::Local, "mistral", None));
        assert_ne!(base, CacheKey::new("What is entropy?", &r, Engine::Cloud, "mistral", None));
        assert_ne!(base, CacheKey::new("What is entropy?", &r, Engine::Local, "llama3", None));
        assert_ne!(base, CacheKey::new("What is entropy?", &r, Engine::Local, "mistral", Some("examiner")));
    }

    #[tokio::test]
    async fn document_epochs_are_dropped_once_nothing_is_running() {
        let cache = AnswerCache::in_memory();
        let r = RetrievalResult::empty();
        let k = CacheKey::new("q", &r, Engine::Local, "mistral", None);

        cache.invalidate_document("idle/doc.txt");
        assert!(cache.inner.state.lock().doc_epochs.is_empty());

        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let task = {
            let (cache, r, k) = (cache.clone(), r.clone(), k.clone());
            tokio::spawn(async move {
                cache
                    .get_or_compute(&k, &r, move || async move {
                        let _ = gate.await;
                        Ok(Computed { answer_text: "a".into(), engine: Engine::Local, cacheable: true })
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.invalidate_document("busy/doc.txt");
        assert_eq!(cache.inner.state.lock().doc_epochs.len(), 1);

        let _ = release.send(());
        task.await.unwrap().unwrap();
        assert!(cache.inner.state.lock().doc_epochs.is_empty());
    }
}
