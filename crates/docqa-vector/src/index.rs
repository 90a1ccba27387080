//! In-memory cosine index with document-scoped write locking.
//!
//! Each document's chunks live in an immutable shard behind an `Arc`. Writers
//! serialize on a per-document async mutex, build the replacement shard (and
//! persist it) without touching readers, then swap the shard pointer under a
//! short write lock. A query clones the shard pointers and scores outside any
//! lock, so it sees every document either entirely before or entirely after a
//! write. Document writers share a gate that [`VectorIndex::clear`] takes
//! exclusively, so a clear never interleaves with a replace.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{OwnedMutexGuard, OwnedRwLockReadGuard};
use tracing::{debug, info};

use docqa_core::traits::CorpusObserver;
use docqa_core::types::{Chunk, ChunkId, DocumentId, SearchFilter, SearchHit, SourceKind};
use docqa_core::{Error, Result};

use crate::store::LanceStore;

struct Entry {
    chunk: Chunk,
    vector: Vec<f32>,
    norm: f32,
}

impl Entry {
    fn new(chunk: Chunk, vector: Vec<f32>) -> Self {
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        Self { chunk, vector, norm }
    }

    fn similarity(&self, query: &[f32], query_norm: f32) -> f32 {
        if self.norm == 0.0 || query_norm == 0.0 {
            return 0.0;
        }
        let dot: f32 = self.vector.iter().zip(query).map(|(a, b)| a * b).sum();
        let distance = 1.0 - dot / (self.norm * query_norm);
        (1.0 - distance).clamp(0.0, 1.0)
    }
}

type Shard = Arc<Vec<Arc<Entry>>>;
type DocLocks = Arc<Mutex<HashMap<DocumentId, Arc<tokio::sync::Mutex<()>>>>>;

/// Exclusive write access to one document. Obtained from
/// [`VectorIndex::lock_document`]; callers may hold it across other index
/// updates for the same document (e.g. the lexical index). Holding one
/// blocks [`VectorIndex::clear`].
pub struct DocumentGuard {
    document_id: DocumentId,
    locks: DocLocks,
    _guard: OwnedMutexGuard<()>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl DocumentGuard {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }
}

impl Drop for DocumentGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // the map and this guard are the only holders: nobody is waiting
        if locks.get(&self.document_id).is_some_and(|l| Arc::strong_count(l) == 2) {
            locks.remove(&self.document_id);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub chunks: usize,
    pub documents: usize,
    pub subjects: BTreeSet<String>,
    pub modules: BTreeSet<String>,
}

pub struct VectorIndex {
    dim: usize,
    shards: RwLock<HashMap<DocumentId, Shard>>,
    doc_locks: DocLocks,
    write_gate: Arc<tokio::sync::RwLock<()>>,
    observers: RwLock<Vec<Arc<dyn CorpusObserver>>>,
    store: Option<LanceStore>,
}

impl VectorIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            shards: RwLock::new(HashMap::new()),
            doc_locks: Arc::new(Mutex::new(HashMap::new())),
            write_gate: Arc::new(tokio::sync::RwLock::new(())),
            observers: RwLock::new(Vec::new()),
            store: None,
        }
    }

    /// Open over a persistent store, loading every stored row.
    pub async fn with_store(store: LanceStore) -> Result<Self> {
        let dim = store.dim();
        let rows = store.load_all().await.map_err(unavailable)?;
        let mut grouped: HashMap<DocumentId, Vec<Arc<Entry>>> = HashMap::new();
        for (chunk, vector) in rows {
            if vector.len() != dim {
                return Err(Error::DimensionMismatch { expected: dim, actual: vector.len() });
            }
            grouped.entry(chunk.document_id.clone()).or_default().push(Arc::new(Entry::new(chunk, vector)));
        }
        let shards: HashMap<DocumentId, Shard> = grouped.into_iter().map(|(k, v)| (k, Arc::new(v))).collect();
        info!(documents = shards.len(), "loaded vector index from store");
        let mut index = Self::new(dim);
        index.shards = RwLock::new(shards);
        index.store = Some(store);
        Ok(index)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn subscribe(&self, observer: Arc<dyn CorpusObserver>) {
        self.observers.write().push(observer);
    }

    pub async fn lock_document(&self, document_id: &str) -> DocumentGuard {
        let gate = Arc::clone(&self.write_gate).read_owned().await;
        let lock = {
            let mut locks = self.doc_locks.lock();
            Arc::clone(locks.entry(document_id.to_string()).or_default())
        };
        DocumentGuard {
            document_id: document_id.to_string(),
            locks: Arc::clone(&self.doc_locks),
            _guard: lock.lock_owned().await,
            _gate: gate,
        }
    }

    /// Swap all chunks of the guarded document for `rows`. Returns the ids the
    /// document held before.
    pub async fn replace_locked(&self, guard: &DocumentGuard, rows: Vec<(Chunk, Vec<f32>)>) -> Result<Vec<ChunkId>> {
        let document_id = guard.document_id();
        for (chunk, vector) in &rows {
            if vector.len() != self.dim {
                return Err(Error::DimensionMismatch { expected: self.dim, actual: vector.len() });
            }
            if chunk.document_id != document_id {
                return Err(Error::InvalidInput(format!(
                    "chunk {} belongs to {}, not {}",
                    chunk.chunk_id, chunk.document_id, document_id
                )));
            }
        }
        if let Some(store) = &self.store {
            store.replace_document(document_id, &rows).await.map_err(unavailable)?;
        }
        let mut entries: Vec<Arc<Entry>> = Vec::with_capacity(rows.len());
        let mut seen = BTreeSet::new();
        // last write wins for a repeated id
        for (chunk, vector) in rows.into_iter().rev() {
            if seen.insert(chunk.chunk_id.clone()) {
                entries.push(Arc::new(Entry::new(chunk, vector)));
            }
        }
        entries.reverse();
        let count = entries.len();
        let previous = {
            let mut shards = self.shards.write();
            if entries.is_empty() {
                shards.remove(document_id)
            } else {
                shards.insert(document_id.to_string(), Arc::new(entries))
            }
        };
        let removed: Vec<ChunkId> = previous.map(|s| s.iter().map(|e| e.chunk.chunk_id.clone()).collect()).unwrap_or_default();
        debug!(document_id, chunks = count, "replaced document vectors");
        self.notify(document_id, &removed);
        Ok(removed)
    }

    pub async fn delete_locked(&self, guard: &DocumentGuard) -> Result<Vec<ChunkId>> {
        let document_id = guard.document_id();
        if let Some(store) = &self.store {
            store.delete_document(document_id).await.map_err(unavailable)?;
        }
        let previous = self.shards.write().remove(document_id);
        let removed: Vec<ChunkId> =
            previous.map(|s| s.iter().map(|e| e.chunk.chunk_id.clone()).collect()).unwrap_or_default();
        if !removed.is_empty() {
            debug!(document_id, chunks = removed.len(), "deleted document vectors");
            self.notify(document_id, &removed);
        }
        Ok(removed)
    }

    pub async fn replace_document(&self, document_id: &str, rows: Vec<(Chunk, Vec<f32>)>) -> Result<Vec<ChunkId>> {
        let guard = self.lock_document(document_id).await;
        self.replace_locked(&guard, rows).await
    }

    /// Remove every chunk of `document_id`; returns the removed ids.
    pub async fn delete_by_document(&self, document_id: &str) -> Result<Vec<ChunkId>> {
        let guard = self.lock_document(document_id).await;
        self.delete_locked(&guard).await
    }

    /// Insert or replace a single chunk.
    pub async fn upsert(&self, chunk: Chunk, vector: Vec<f32>) -> Result<()> {
        let guard = self.lock_document(&chunk.document_id).await;
        let mut rows: Vec<(Chunk, Vec<f32>)> = self
            .shard(&chunk.document_id)
            .map(|s| {
                s.iter()
                    .filter(|e| e.chunk.chunk_id != chunk.chunk_id)
                    .map(|e| (e.chunk.clone(), e.vector.clone()))
                    .collect()
            })
            .unwrap_or_default();
        rows.push((chunk, vector));
        rows.sort_by_key(|(c, _)| c.start_offset);
        self.replace_locked(&guard, rows).await.map(|_| ())
    }

    /// Top-k chunks by cosine similarity, best first. An empty index yields
    /// an empty list.
    pub fn query(&self, vector: &[f32], k: usize, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
        if vector.len() != self.dim {
            return Err(Error::DimensionMismatch { expected: self.dim, actual: vector.len() });
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        let mut hits: Vec<SearchHit> = self
            .snapshot()
            .iter()
            .flat_map(|s| s.iter())
            .filter(|e| filter.matches(&e.chunk))
            .map(|e| SearchHit { id: e.chunk.chunk_id.clone(), score: e.similarity(vector, query_norm), source: SourceKind::Vector })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }

    pub fn get(&self, chunk_id: &str) -> Option<Chunk> {
        self.entry(chunk_id).map(|e| e.chunk.clone())
    }

    /// Similarity between a stored chunk and `vector`, `None` if the chunk is unknown.
    pub fn similarity(&self, chunk_id: &str, vector: &[f32]) -> Option<f32> {
        if vector.len() != self.dim {
            return None;
        }
        let query_norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        self.entry(chunk_id).map(|e| e.similarity(vector, query_norm))
    }

    /// Current chunks of a document with their vectors, in stored order.
    pub fn document_rows(&self, document_id: &str) -> Vec<(Chunk, Vec<f32>)> {
        self.shard(document_id)
            .map(|s| s.iter().map(|e| (e.chunk.clone(), e.vector.clone())).collect())
            .unwrap_or_default()
    }

    pub fn document_chunk_ids(&self, document_id: &str) -> Vec<ChunkId> {
        self.shard(document_id)
            .map(|s| s.iter().map(|e| e.chunk.chunk_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.shards.read().values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats::default();
        for shard in self.snapshot() {
            stats.documents += 1;
            stats.chunks += shard.len();
            for e in shard.iter() {
                stats.subjects.insert(e.chunk.subject.clone());
                stats.modules.insert(e.chunk.module.clone());
            }
        }
        stats
    }

    /// Drop every document. Waits for in-flight document writers; calling it
    /// while holding a [`DocumentGuard`] deadlocks.
    pub async fn clear(&self) -> Result<()> {
        let _gate = self.write_gate.write().await;
        if let Some(store) = &self.store {
            store.clear().await.map_err(unavailable)?;
        }
        let dropped = std::mem::take(&mut *self.shards.write());
        info!(documents = dropped.len(), "cleared vector index");
        let observers = self.observers.read().clone();
        for o in observers {
            o.corpus_cleared();
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<Shard> {
        self.shards.read().values().cloned().collect()
    }

    fn shard(&self, document_id: &str) -> Option<Shard> {
        self.shards.read().get(document_id).cloned()
    }

    fn entry(&self, chunk_id: &str) -> Option<Arc<Entry>> {
        let (document_id, _) = chunk_id.rsplit_once(':')?;
        let shard = self.shard(document_id)?;
        shard.iter().find(|e| e.chunk.chunk_id == chunk_id).cloned()
    }

    fn notify(&self, document_id: &str, chunk_ids: &[ChunkId]) {
        let observers = self.observers.read().clone();
        for o in observers {
            o.chunks_changed(document_id, chunk_ids);
        }
    }
}

fn unavailable(e: anyhow::Error) -> Error {
    Error::RetrievalUnavailable(format!("{e:#}"))
}
