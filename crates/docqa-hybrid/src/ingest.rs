use std::sync::Arc;

use tracing::{error, info, warn};

use docqa_core::chunker::Chunker;
use docqa_core::traits::LexicalIndex;
use docqa_core::types::{Chunk, ChunkId, Document};
use docqa_core::{Error, Result};
use docqa_embed::EmbeddingProvider;
use docqa_vector::VectorIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub document_id: String,
    pub chunk_ids: Vec<ChunkId>,
    /// Ids the document held before this ingestion.
    pub replaced: usize,
}

/// Chunk, embed and index documents. Re-ingesting a document replaces all
/// of its previous chunks in both indexes.
#[derive(Clone)]
pub struct Ingestor {
    chunker: Chunker,
    provider: EmbeddingProvider,
    vectors: Arc<VectorIndex>,
    lexical: Option<Arc<dyn LexicalIndex>>,
}

impl Ingestor {
    pub fn new(
        chunker: Chunker,
        provider: EmbeddingProvider,
        vectors: Arc<VectorIndex>,
        lexical: Option<Arc<dyn LexicalIndex>>,
    ) -> Self {
        Self { chunker, provider, vectors, lexical }
    }

    pub async fn ingest(&self, doc: &Document) -> Result<IngestReport> {
        let chunks = self.chunker.chunk(doc);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        // embedding runs before the document lock is taken
        let vectors = self.provider.embed_batch(&texts).await?;
        let chunk_ids: Vec<ChunkId> = chunks.iter().map(|c| c.chunk_id.clone()).collect();

        let guard = self.vectors.lock_document(&doc.id).await;
        let previous = self.vectors.document_rows(&doc.id);
        let rows: Vec<(Chunk, Vec<f32>)> = chunks.iter().cloned().zip(vectors).collect();
        let replaced = self.vectors.replace_locked(&guard, rows).await?;
        if let Some(lexical) = &self.lexical {
            let lexical = Arc::clone(lexical);
            let document_id = doc.id.clone();
            if let Err(e) = run_blocking(move || lexical.replace_document(&document_id, &chunks)).await {
                // put the previous vectors back so both indexes hold the same version
                match self.vectors.replace_locked(&guard, previous).await {
                    Ok(_) => warn!(document_id = %doc.id, error = %e, "lexical write failed, document rolled back"),
                    Err(rollback) => error!(
                        document_id = %doc.id, error = %e, rollback = %rollback,
                        "lexical index out of step with vectors"
                    ),
                }
                return Err(e);
            }
        }
        drop(guard);

        info!(document_id = %doc.id, chunks = chunk_ids.len(), replaced = replaced.len(), "ingested document");
        Ok(IngestReport { document_id: doc.id.clone(), chunk_ids, replaced: replaced.len() })
    }

    /// Ingest documents one after another; stops at the first failure.
    pub async fn ingest_all(&self, docs: &[Document]) -> Result<Vec<IngestReport>> {
        let mut reports = Vec::with_capacity(docs.len());
        for doc in docs {
            reports.push(self.ingest(doc).await?);
        }
        Ok(reports)
    }

    pub async fn remove_document(&self, document_id: &str) -> Result<Vec<ChunkId>> {
        let guard = self.vectors.lock_document(document_id).await;
        let removed = self.vectors.delete_locked(&guard).await?;
        if let Some(lexical) = &self.lexical {
            let lexical = Arc::clone(lexical);
            let id = document_id.to_string();
            run_blocking(move || lexical.delete_document(&id)).await?;
        }
        info!(document_id, chunks = removed.len(), "removed document");
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<()> {
        self.vectors.clear().await?;
        if let Some(lexical) = &self.lexical {
            let lexical = Arc::clone(lexical);
            run_blocking(move || lexical.clear()).await?;
        }
        Ok(())
    }
}

async fn run_blocking<F>(f: F) -> Result<()>
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::RetrievalUnavailable(format!("{e:#}"))),
        Err(e) => Err(Error::RetrievalUnavailable(format!("lexical index task failed: {e}"))),
    }
}
