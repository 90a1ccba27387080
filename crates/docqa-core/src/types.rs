//! Domain types shared by the index, retriever and answering layers.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type ChunkId = String;
pub type DocumentId = String;

/// One page-level piece of extracted text, as handed over by the ingestion
/// front-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSegment {
    pub text: String,
    pub page: u32,
}

impl TextSegment {
    pub fn new(text: impl Into<String>, page: u32) -> Self {
        Self { text: text.into(), page }
    }
}

/// A source document in the library.
///
/// - `id`: stable identity, `subject/module/filename` when built with
///   [`Document::new`]
/// - `segments`: ordered extracted text with page numbers
///
/// Documents are immutable once ingested; re-ingesting the same `id` replaces
/// every chunk derived from the previous version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub subject: String,
    pub module: String,
    pub filename: String,
    pub segments: Vec<TextSegment>,
}

impl Document {
    pub fn new(
        subject: impl Into<String>,
        module: impl Into<String>,
        filename: impl Into<String>,
        segments: Vec<TextSegment>,
    ) -> Self {
        let subject = subject.into();
        let module = module.into();
        let filename = filename.into();
        let id = document_id(&subject, &module, &filename);
        Self { id, subject, module, filename, segments }
    }
}

pub fn document_id(subject: &str, module: &str, filename: &str) -> DocumentId {
    format!("{subject}/{module}/{filename}")
}

/// Chunk id derived from the owning document and the byte offset of the chunk
/// start, so re-chunking an unchanged document reproduces the same ids.
pub fn chunk_id(document_id: &str, start_offset: usize) -> ChunkId {
    format!("{document_id}:{start_offset}")
}

/// The atomic retrieval unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub text: String,
    pub page: u32,
    pub start_offset: usize,
    pub end_offset: usize,
    pub subject: String,
    pub module: String,
    pub filename: String,
}

/// Optional metadata restriction applied to both vector and lexical queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub subject: Option<String>,
    pub module: Option<String>,
}

impl SearchFilter {
    pub fn matches(&self, chunk: &Chunk) -> bool {
        self.subject.as_deref().map_or(true, |s| s == chunk.subject)
            && self.module.as_deref().map_or(true, |m| m == chunk.module)
    }

    pub fn is_empty(&self) -> bool {
        self.subject.is_none() && self.module.is_none()
    }
}

/// Indicates which engine produced a result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SourceKind {
    Vector,
    Text,
}

/// The minimal surface returned by both the vector and the lexical index.
///
/// `id` matches `Chunk::chunk_id`. Higher `score` is always better; vector
/// scores are bounded to [0, 1], lexical scores are raw BM25.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: ChunkId,
    pub score: f32,
    pub source: SourceKind,
}

/// A chunk selected by the retriever together with its score breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: f32,
    pub vector_score: f32,
    pub lexical_score: f32,
}

/// Ranked context for one question. Scores are non-increasing by rank.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub hits: Vec<RetrievedChunk>,
    pub confidence: f32,
}

impl RetrievalResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn sorted_chunk_ids(&self) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = self.hits.iter().map(|h| h.chunk.chunk_id.clone()).collect();
        ids.sort();
        ids
    }

    pub fn document_ids(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self.hits.iter().map(|h| h.chunk.document_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn sources(&self) -> Vec<SourceRef> {
        self.hits
            .iter()
            .map(|h| SourceRef {
                chunk_id: h.chunk.chunk_id.clone(),
                document_id: h.chunk.document_id.clone(),
                page: h.chunk.page,
                score: h.score,
            })
            .collect()
    }
}

/// Model engine family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    Local,
    Cloud,
}

impl Engine {
    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Local => "local",
            Engine::Cloud => "cloud",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingReason {
    /// Chosen from the retrieval confidence against the threshold.
    Confidence,
    /// The caller pinned the engine through a hint.
    UserForced,
    /// Cloud was wanted but is not configured or failed; local took over.
    CloudUnavailableFallback,
    /// The caller did not enable cloud for this request.
    CloudDisabled,
}

/// Transient per-request routing choice. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub engine: Engine,
    pub reason: RoutingReason,
}

/// Caller hints that refine a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AskHints {
    /// Pin the engine regardless of confidence.
    pub engine: Option<Engine>,
    /// Override the backend's default model.
    pub model: Option<String>,
    /// Persona used to build the system prompt.
    pub agent: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
    pub use_cloud: bool,
    pub filter: SearchFilter,
    pub hints: AskHints,
}

impl AskRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self { question: question.into(), ..Self::default() }
    }

    pub fn with_cloud(mut self, use_cloud: bool) -> Self {
        self.use_cloud = use_cloud;
        self
    }

    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_hints(mut self, hints: AskHints) -> Self {
        self.hints = hints;
        self
    }
}

/// Citation returned with an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub page: u32,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer_text: String,
    pub sources: Vec<SourceRef>,
    pub cached: bool,
    /// `None` only when an ungrounded question was declined without a model call.
    pub engine_used: Option<Engine>,
    pub routing: Option<RoutingDecision>,
    pub confidence: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(subject: &str, module: &str) -> Chunk {
        Chunk {
            chunk_id: chunk_id("d", 0),
            document_id: "d".into(),
            text: "t".into(),
            page: 1,
            start_offset: 0,
            end_offset: 1,
            subject: subject.into(),
            module: module.into(),
            filename: "f.pdf".into(),
        }
    }

    #[test]
    fn document_id_joins_parts() {
        let doc = Document::new("physics", "thermo", "notes.pdf", vec![]);
        assert_eq!(doc.id, "physics/thermo/notes.pdf");
        assert_eq!(chunk_id(&doc.id, 42), "physics/thermo/notes.pdf:42");
    }

    #[test]
    fn filter_matches_subject_and_module() {
        let c = chunk("physics", "thermo");
        assert!(SearchFilter::default().matches(&c));
        assert!(SearchFilter { subject: Some("physics".into()), module: None }.matches(&c));
        assert!(!SearchFilter { subject: Some("physics".into()), module: Some("optics".into()) }.matches(&c));
    }

    #[test]
    fn engine_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Engine::Local).unwrap(), "\"local\"");
        assert_eq!(
            serde_json::to_string(&RoutingReason::CloudUnavailableFallback).unwrap(),
            "\"cloud_unavailable_fallback\""
        );
    }
}
