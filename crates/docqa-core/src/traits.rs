use crate::types::{Chunk, ChunkId, SearchFilter, SearchHit};

/// Text to vector. Implementations are synchronous and CPU/GPU bound; async
/// callers go through the provider adapter in `docqa-embed`.
pub trait Embedder: Send + Sync {
    /// Stable identifier of the model, part of every answer cache key.
    fn id(&self) -> &str;
    fn dim(&self) -> usize;
    fn max_len(&self) -> usize;
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Keyword index over chunk text. Scores are raw and only comparable within
/// one result list.
pub trait LexicalIndex: Send + Sync {
    /// Atomically swap every entry of `document_id` for `chunks`.
    fn replace_document(&self, document_id: &str, chunks: &[Chunk]) -> anyhow::Result<()>;
    fn delete_document(&self, document_id: &str) -> anyhow::Result<()>;
    fn search(&self, query: &str, k: usize, filter: &SearchFilter) -> anyhow::Result<Vec<SearchHit>>;
    fn clear(&self) -> anyhow::Result<()>;
}

/// Notified after a write to the corpus has become visible to readers.
pub trait CorpusObserver: Send + Sync {
    /// `chunk_ids` holds every id removed or replaced by the write.
    fn chunks_changed(&self, document_id: &str, chunk_ids: &[ChunkId]);

    /// The whole corpus was dropped.
    fn corpus_cleared(&self);
}
