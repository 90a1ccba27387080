//! Pattern-based PII redaction for cloud-bound payloads.
//!
//! Matches are replaced with bracketed placeholders such as `[REDACTED_EMAIL]`
//! that keep the sentence readable. Built-in placeholders contain neither
//! digits nor `@`, so every pass shrinks what the patterns can match and
//! repeating passes reaches a fixpoint; that fixpoint is what makes
//! `sanitize(sanitize(x)) == sanitize(x)`.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use tracing::warn;

use docqa_core::config::{PatternSettings, SanitizerSettings};
use docqa_core::types::{Chunk, RetrievedChunk};
use docqa_core::{Error, Result};

static RE_EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static regex"));
static RE_CARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{1,4}").expect("static regex"));
static RE_SSN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{3}-\d{2}-\d{4}").expect("static regex"));
static RE_PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{3}\)|\d{3})[\s.-]?\d{3}[\s.-]?\d{4}").expect("static regex")
});

const MAX_PASSES: usize = 16;
const TRUNCATION_MARKER: &str = " ... [TRUNCATED]";

struct PiiPattern {
    name: String,
    regex: Regex,
    placeholder: String,
}

/// Text that went through [`Sanitizer::sanitize`]. Only the sanitizer
/// constructs it, so holding one proves redaction ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedText(String);

impl SanitizedText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for SanitizedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A retrieved chunk prepared for a cloud prompt: metadata kept, text redacted
/// and bounded.
#[derive(Debug, Clone)]
pub struct CloudExcerpt {
    pub chunk: Chunk,
    pub filename: SanitizedText,
    pub text: SanitizedText,
}

pub struct Sanitizer {
    patterns: Vec<PiiPattern>,
    max_chunks: usize,
    max_chunk_chars: usize,
}

impl Sanitizer {
    pub fn new(settings: &SanitizerSettings) -> Result<Self> {
        let mut patterns = builtin_patterns();
        for p in &settings.extra_patterns {
            patterns.push(compile(p)?);
        }
        Ok(Self { patterns, max_chunks: settings.max_chunks_cloud, max_chunk_chars: settings.max_chunk_chars_cloud })
    }

    pub fn sanitize(&self, text: &str) -> SanitizedText {
        let mut current = text.to_string();
        for _ in 0..MAX_PASSES {
            let next = self.pass(&current);
            if next == current {
                return SanitizedText(current);
            }
            current = next;
        }
        warn!(passes = MAX_PASSES, "sanitizer did not reach a fixpoint");
        SanitizedText(current)
    }

    /// True when no pattern matches `text`.
    pub fn verify(&self, text: &str) -> bool {
        self.patterns.iter().all(|p| !p.regex.is_match(text))
    }

    /// Names of the pattern classes found in `text`, for diagnostics.
    pub fn detected(&self, text: &str) -> Vec<&str> {
        self.patterns.iter().filter(|p| p.regex.is_match(text)).map(|p| p.name.as_str()).collect()
    }

    /// Top chunks for a cloud prompt: at most `max_chunks_cloud`, each
    /// redacted and then cut at a word boundary to `max_chunk_chars_cloud`.
    pub fn prepare_cloud_context(&self, hits: &[RetrievedChunk]) -> Vec<CloudExcerpt> {
        hits.iter()
            .take(self.max_chunks)
            .map(|h| {
                let redacted = self.sanitize(&h.chunk.text).into_inner();
                CloudExcerpt {
                    chunk: h.chunk.clone(),
                    filename: self.sanitize(&h.chunk.filename),
                    text: SanitizedText(truncate_at_word(&redacted, self.max_chunk_chars)),
                }
            })
            .collect()
    }

    fn pass(&self, text: &str) -> String {
        let mut out = text.to_string();
        for p in &self.patterns {
            if p.regex.is_match(&out) {
                out = p.regex.replace_all(&out, p.placeholder.as_str()).into_owned();
            }
        }
        out
    }
}

fn builtin_patterns() -> Vec<PiiPattern> {
    fn p(name: &str, regex: &Regex, placeholder: &str) -> PiiPattern {
        PiiPattern { name: name.to_string(), regex: regex.clone(), placeholder: placeholder.to_string() }
    }
    // cards before phones: a card number contains a phone-shaped run
    vec![
        p("email", &RE_EMAIL, "[REDACTED_EMAIL]"),
        p("card", &RE_CARD, "[REDACTED_CARD]"),
        p("ssn", &RE_SSN, "[REDACTED_SSN]"),
        p("phone", &RE_PHONE, "[REDACTED_PHONE]"),
    ]
}

fn compile(p: &PatternSettings) -> Result<PiiPattern> {
    let regex = Regex::new(&p.regex)
        .map_err(|e| Error::InvalidConfig(format!("sanitizer pattern '{}': {}", p.name, e)))?;
    Ok(PiiPattern { name: p.name.clone(), regex, placeholder: p.placeholder.clone() })
}

fn truncate_at_word(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut = text.char_indices().nth(max_chars).map(|(i, _)| i).unwrap_or(text.len());
    let head = &text[..cut];
    let head = match head.rfind(char::is_whitespace) {
        Some(ws) if ws > 0 => &head[..ws],
        _ => head,
    };
    format!("{}{}", head.trim_end(), TRUNCATION_MARKER)
}
