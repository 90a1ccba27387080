//! Splits a document's page segments into overlapping retrieval chunks.
//!
//! Boundaries are sentence or paragraph breaks where possible. Units are packed
//! greedily into a character budget; consecutive chunks share trailing units up
//! to the overlap budget. A single unit longer than the budget is hard-split at
//! the budget boundary. Chunks never span two pages.

use regex::Regex;
use std::sync::LazyLock;

use crate::config::ChunkingSettings;
use crate::types::{chunk_id, Chunk, Document, TextSegment};

static SENTENCE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[.!?]+["')\]]*\s+|\n\s*\n"#).expect("static regex"));
static URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").expect("static regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_percent: f32,
    pub min_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingSettings::default().into()
    }
}

impl From<ChunkingSettings> for ChunkingConfig {
    fn from(s: ChunkingSettings) -> Self {
        Self { max_chars: s.max_chars.max(1), overlap_percent: s.overlap_percent, min_chars: s.min_chars }
    }
}

impl ChunkingConfig {
    fn overlap_chars(&self) -> usize {
        ((self.max_chars as f32) * self.overlap_percent.clamp(0.0, 0.95)) as usize
    }
}

#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunk every segment of `doc`. Offsets index into the segments joined by
    /// a single newline, so ids stay stable as long as the text and the
    /// parameters do.
    pub fn chunk(&self, doc: &Document) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut base = 0usize;
        for segment in &doc.segments {
            self.chunk_segment(doc, segment, base, &mut chunks);
            base += segment.text.len() + 1;
        }
        chunks
    }

    fn chunk_segment(&self, doc: &Document, segment: &TextSegment, base: usize, out: &mut Vec<Chunk>) {
        let text = segment.text.as_str();
        let units = self.units(text);
        let max = self.config.max_chars;
        let overlap = self.config.overlap_chars();
        let n = units.len();

        let mut i = 0;
        while i < n {
            let mut j = i;
            while j + 1 < n && span_chars(text, units[i].0, units[j + 1].1) <= max {
                j += 1;
            }
            self.emit(doc, segment, base, units[i].0, units[j].1, out);
            if j + 1 >= n {
                break;
            }
            // Smallest carried-over start that still leaves room for the next unit.
            let mut next = j + 1;
            for cand in (i + 1)..=j {
                if span_chars(text, units[cand].0, units[j].1) <= overlap
                    && span_chars(text, units[cand].0, units[j + 1].1) <= max
                {
                    next = cand;
                    break;
                }
            }
            i = next;
        }
    }

    fn emit(&self, doc: &Document, segment: &TextSegment, base: usize, start: usize, end: usize, out: &mut Vec<Chunk>) {
        let cleaned = clean_text(&segment.text[start..end]);
        if cleaned.is_empty() || cleaned.chars().count() < self.config.min_chars {
            return;
        }
        let start_offset = base + start;
        out.push(Chunk {
            chunk_id: chunk_id(&doc.id, start_offset),
            document_id: doc.id.clone(),
            text: cleaned,
            page: segment.page,
            start_offset,
            end_offset: base + end,
            subject: doc.subject.clone(),
            module: doc.module.clone(),
            filename: doc.filename.clone(),
        });
    }

    /// Sentence/paragraph units as byte ranges, oversized ones hard-split.
    fn units(&self, text: &str) -> Vec<(usize, usize)> {
        let mut raw = Vec::new();
        let mut start = 0;
        for m in SENTENCE_BREAK.find_iter(text) {
            push_trimmed(text, start, m.end(), &mut raw);
            start = m.end();
        }
        push_trimmed(text, start, text.len(), &mut raw);

        let max = self.config.max_chars;
        let mut units = Vec::with_capacity(raw.len());
        for (s, e) in raw {
            if span_chars(text, s, e) <= max {
                units.push((s, e));
            } else {
                hard_split(text, s, e, max, &mut units);
            }
        }
        units
    }
}

fn push_trimmed(text: &str, start: usize, end: usize, out: &mut Vec<(usize, usize)>) {
    let slice = &text[start..end];
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return;
    }
    let s = start + (slice.len() - slice.trim_start().len());
    out.push((s, s + trimmed.len()));
}

fn hard_split(text: &str, start: usize, end: usize, max: usize, out: &mut Vec<(usize, usize)>) {
    let mut piece_start = start;
    let mut count = 0;
    for (idx, _) in text[start..end].char_indices() {
        if count == max {
            out.push((piece_start, start + idx));
            piece_start = start + idx;
            count = 0;
        }
        count += 1;
    }
    if piece_start < end {
        out.push((piece_start, end));
    }
}

fn span_chars(text: &str, start: usize, end: usize) -> usize {
    text[start..end].chars().count()
}

/// Drop URLs and collapse whitespace.
pub fn clean_text(text: &str) -> String {
    let without_urls = URL.replace_all(text, " ");
    WHITESPACE.replace_all(&without_urls, " ").trim().to_string()
}
