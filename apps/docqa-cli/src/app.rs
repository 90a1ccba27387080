use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use docqa_answer::{AnswerCache, CloudBackend, ModelBackend, OllamaBackend, Orchestrator, Sanitizer};
use docqa_core::chunker::{Chunker, ChunkingConfig};
use docqa_core::config::{expand_path, Config, Settings};
use docqa_core::traits::{Embedder, LexicalIndex};
use docqa_embed::{get_default_embedder, EmbeddingProvider};
use docqa_hybrid::{Ingestor, Retriever};
use docqa_text::TantivyLexicalIndex;
use docqa_vector::{LanceStore, VectorIndex};

/// Everything a command needs, wired from one [`Settings`].
pub struct App {
    pub settings: Settings,
    pub vectors: Arc<VectorIndex>,
    pub ingestor: Ingestor,
    pub orchestrator: Orchestrator,
}

impl App {
    pub async fn build(config: &Config) -> Result<Self> {
        let settings = config.settings()?;

        let embedder: Arc<dyn Embedder> = Arc::from(get_default_embedder(&settings.embedding)?);
        let provider = EmbeddingProvider::new(embedder, &settings.embedding);

        let index_dir = expand_path(&settings.storage.index_dir);
        std::fs::create_dir_all(&index_dir)?;
        let store = LanceStore::open(&index_dir.to_string_lossy(), &settings.storage.table, provider.dim()).await?;
        let vectors = Arc::new(VectorIndex::with_store(store).await?);

        let text_dir = expand_path(&settings.storage.text_index_dir);
        let lexical: Arc<dyn LexicalIndex> = Arc::new(TantivyLexicalIndex::open_or_create(&text_dir)?);

        let chunker = Chunker::new(ChunkingConfig::from(settings.chunking.clone()));
        let ingestor = Ingestor::new(chunker, provider.clone(), vectors.clone(), Some(lexical.clone()));
        let retriever = Retriever::new(provider, vectors.clone(), Some(lexical), settings.retrieval.clone());

        let cache = AnswerCache::open(&settings.cache)?;
        vectors.subscribe(Arc::new(cache.clone()));

        let sanitizer = Arc::new(Sanitizer::new(&settings.sanitizer)?);
        let local: Arc<dyn ModelBackend> = Arc::new(OllamaBackend::new(&settings.local_model)?);
        let cloud = CloudBackend::from_settings(&settings.cloud_model, sanitizer.clone())?
            .map(|c| Arc::new(c) as Arc<dyn ModelBackend>);
        if cloud.is_none() {
            warn!(env = %settings.cloud_model.api_key_env, "cloud model not configured; answering locally only");
        }

        let stats = vectors.stats();
        info!(chunks = stats.chunks, documents = stats.documents, cached = cache.len(), "library loaded");

        let orchestrator = Orchestrator::new(retriever, cache, sanitizer, local, cloud, settings.routing.clone());
        Ok(Self { settings, vectors, ingestor, orchestrator })
    }
}
