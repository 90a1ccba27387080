use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use docqa_core::config::RetrievalSettings;
use docqa_core::traits::LexicalIndex;
use docqa_core::types::{ChunkId, RetrievalResult, RetrievedChunk, SearchFilter};
use docqa_core::{Error, Result};
use docqa_embed::EmbeddingProvider;
use docqa_vector::VectorIndex;

use crate::scoring::{confidence, dedup_adjacent, hybrid_score, normalize_by_max, sort_ranked, term_overlap, terms};

/// Question to ranked context. Holds no index lock across the embedding call
/// or the lexical search.
#[derive(Clone)]
pub struct Retriever {
    provider: EmbeddingProvider,
    vectors: Arc<VectorIndex>,
    lexical: Option<Arc<dyn LexicalIndex>>,
    settings: RetrievalSettings,
}

impl Retriever {
    pub fn new(
        provider: EmbeddingProvider,
        vectors: Arc<VectorIndex>,
        lexical: Option<Arc<dyn LexicalIndex>>,
        settings: RetrievalSettings,
    ) -> Self {
        Self { provider, vectors, lexical, settings }
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    pub async fn retrieve(&self, question: &str, filter: &SearchFilter) -> Result<RetrievalResult> {
        if question.trim().is_empty() {
            return Err(Error::InvalidInput("question is empty".into()));
        }
        if self.vectors.is_empty() {
            debug!("retrieval against empty index");
            return Ok(RetrievalResult::empty());
        }

        let query = self.provider.embed(question).await?;
        let n = self.settings.candidates.max(self.settings.top_k);
        let vector_hits = self.vectors.query(&query, n, filter)?;

        let mut vector_scores: HashMap<ChunkId, f32> = vector_hits.into_iter().map(|h| (h.id, h.score)).collect();
        let lexical_scores = match self.lexical_scores(question, n, filter).await {
            Some(scores) => {
                for id in scores.keys() {
                    if !vector_scores.contains_key(id) {
                        if let Some(sim) = self.vectors.similarity(id, &query) {
                            vector_scores.insert(id.clone(), sim);
                        }
                    }
                }
                scores
            }
            None => {
                let question_terms = terms(question);
                vector_scores
                    .keys()
                    .filter_map(|id| self.vectors.get(id).map(|c| (id.clone(), term_overlap(&question_terms, &c.text))))
                    .collect()
            }
        };

        let alpha = self.settings.alpha;
        let mut ranked: Vec<RetrievedChunk> = vector_scores
            .into_iter()
            .filter_map(|(id, v)| {
                // lexical ids can outlive their chunk for one swap
                let chunk = self.vectors.get(&id).filter(|c| filter.matches(c))?;
                let l = lexical_scores.get(&id).copied().unwrap_or(0.0);
                Some(RetrievedChunk { chunk, score: hybrid_score(alpha, v, l), vector_score: v, lexical_score: l })
            })
            .collect();
        sort_ranked(&mut ranked);
        let mut hits = dedup_adjacent(ranked, self.settings.dedup_window);
        hits.truncate(self.settings.top_k);

        let confidence = confidence(&hits, self.settings.confidence);
        debug!(hits = hits.len(), confidence, "retrieved");
        Ok(RetrievalResult { hits, confidence })
    }

    /// Max-normalized BM25 scores, or `None` when lexical scoring is off or
    /// the index failed; the caller then falls back to term overlap.
    async fn lexical_scores(&self, question: &str, k: usize, filter: &SearchFilter) -> Option<HashMap<ChunkId, f32>> {
        if !self.settings.enable_lexical {
            return None;
        }
        let lexical = Arc::clone(self.lexical.as_ref()?);
        let q = question.to_string();
        let f = filter.clone();
        let res = tokio::task::spawn_blocking(move || lexical.search(&q, k, &f)).await;
        let hits = match res {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                warn!(error = %e, "lexical search failed, using term overlap");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "lexical search task failed, using term overlap");
                return None;
            }
        };
        let mut scores: Vec<(String, f32)> = hits.into_iter().map(|h| (h.id, h.score)).collect();
        normalize_by_max(&mut scores);
        Some(scores.into_iter().collect())
    }
}
