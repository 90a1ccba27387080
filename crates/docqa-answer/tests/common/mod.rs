#![allow(clippy::unwrap_used)]

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use docqa_answer::{AnswerCache, FragmentStream, ModelBackend, Orchestrator, Prompt, Sanitizer};
use docqa_core::chunker::{Chunker, ChunkingConfig};
use docqa_core::config::{EmbeddingSettings, RetrievalSettings, RoutingSettings, SanitizerSettings};
use docqa_core::traits::LexicalIndex;
use docqa_core::types::{Document, Engine, TextSegment};
use docqa_core::{Error, Result};
use docqa_embed::{EmbeddingProvider, HashEmbedder};
use docqa_hybrid::{Ingestor, Retriever};
use docqa_text::TantivyLexicalIndex;
use docqa_vector::VectorIndex;

pub const DIM: usize = 256;
pub const QUESTION: &str = "What is the second law of thermodynamics?";
pub const THERMO_DOC: &str = "physics/thermodynamics/lecture-3.txt";

enum Behavior {
    Reply,
    Fail(Error),
    /// Never yields a fragment.
    Hang,
}

/// In-process model backend with a fixed reply, split into word fragments.
pub struct ScriptedBackend {
    engine: Engine,
    model: String,
    reply: Vec<String>,
    delay: Duration,
    behavior: Behavior,
    fail_first: AtomicUsize,
    calls: AtomicUsize,
    completed: Arc<AtomicUsize>,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedBackend {
    pub fn new(engine: Engine, reply: &str) -> Self {
        let mut reply: Vec<String> = reply.split_inclusive(' ').map(str::to_string).collect();
        if reply.is_empty() {
            reply.push(String::new());
        }
        Self {
            engine,
            model: format!("scripted-{engine}"),
            reply,
            delay: Duration::ZERO,
            behavior: Behavior::Reply,
            fail_first: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            completed: Arc::new(AtomicUsize::new(0)),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn local(reply: &str) -> Self {
        Self::new(Engine::Local, reply)
    }

    pub fn cloud(reply: &str) -> Self {
        Self::new(Engine::Cloud, reply)
    }

    /// Pause before every fragment.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, error: Error) -> Self {
        self.behavior = Behavior::Fail(error);
        self
    }

    pub fn hanging(mut self) -> Self {
        self.behavior = Behavior::Hang;
        self
    }

    /// Fail the first `n` calls as unavailable, then reply.
    pub fn fail_first(self, n: usize) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Streams that ran to the end.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn reply(&self) -> String {
        self.reply.concat()
    }

    pub fn last_prompt(&self) -> Option<Prompt> {
        self.prompts.lock().last().cloned()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn engine(&self) -> Engine {
        self.engine
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn generate_stream(&self, prompt: &Prompt) -> Result<FragmentStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.clone());
        if self.fail_first.load(Ordering::SeqCst) > 0 {
            self.fail_first.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::unavailable(self.engine, "scripted outage"));
        }
        match &self.behavior {
            Behavior::Fail(e) => return Err(e.clone()),
            Behavior::Hang => return Ok(stream::pending().boxed()),
            Behavior::Reply => {}
        }
        let fragments: VecDeque<String> = self.reply.iter().cloned().collect();
        let delay = self.delay;
        let completed = Arc::clone(&self.completed);
        Ok(stream::unfold(fragments, move |mut rest| {
            let completed = Arc::clone(&completed);
            async move {
                match rest.pop_front() {
                    Some(fragment) => {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        Some((Ok(fragment), rest))
                    }
                    None => {
                        completed.fetch_add(1, Ordering::SeqCst);
                        None
                    }
                }
            }
        })
        .boxed())
    }
}

pub fn library() -> Vec<Document> {
    vec![
        Document::new(
            "physics",
            "thermodynamics",
            "lecture-3.txt",
            vec![
                TextSegment::new("Temperature measures the average kinetic energy of particles.", 11),
                TextSegment::new("Entropy increases in an isolated system (Second Law of Thermodynamics).", 12),
            ],
        ),
        Document::new(
            "biology",
            "cells",
            "mitosis.txt",
            vec![TextSegment::new("Cells divide through mitosis. Chromosomes condense before division.", 3)],
        ),
        Document::new(
            "physics",
            "optics",
            "lenses.txt",
            vec![TextSegment::new("A convex lens converges parallel light rays to a focal point.", 7)],
        ),
    ]
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub ingestor: Ingestor,
    pub vectors: Arc<VectorIndex>,
    pub cache: AnswerCache,
    pub local: Arc<ScriptedBackend>,
    pub cloud: Option<Arc<ScriptedBackend>>,
}

pub fn harness(local: ScriptedBackend, cloud: Option<ScriptedBackend>, routing: RoutingSettings) -> Harness {
    let provider = EmbeddingProvider::new(
        Arc::new(HashEmbedder::new(DIM)),
        &EmbeddingSettings { dim: DIM, backoff_ms: 1, ..EmbeddingSettings::default() },
    );
    let vectors = Arc::new(VectorIndex::new(DIM));
    let lexical: Arc<dyn LexicalIndex> = Arc::new(TantivyLexicalIndex::in_memory().unwrap());
    let chunker = Chunker::new(ChunkingConfig { max_chars: 200, overlap_percent: 0.15, min_chars: 1 });
    let ingestor = Ingestor::new(chunker, provider.clone(), vectors.clone(), Some(lexical.clone()));
    let retriever = Retriever::new(provider, vectors.clone(), Some(lexical), RetrievalSettings::default());

    let cache = AnswerCache::in_memory();
    vectors.subscribe(Arc::new(cache.clone()));
    let sanitizer = Arc::new(Sanitizer::new(&SanitizerSettings::default()).unwrap());

    let local = Arc::new(local);
    let cloud = cloud.map(Arc::new);
    let orchestrator = Orchestrator::new(
        retriever,
        cache.clone(),
        sanitizer,
        local.clone(),
        cloud.clone().map(|c| c as Arc<dyn ModelBackend>),
        routing,
    );
    Harness { orchestrator, ingestor, vectors, cache, local, cloud }
}

/// Short timeouts so fallback tests finish quickly.
pub fn fast_routing() -> RoutingSettings {
    RoutingSettings { cloud_timeout_secs: 1, local_timeout_secs: 5, idle_timeout_secs: 1, ..RoutingSettings::default() }
}
