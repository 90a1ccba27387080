use std::collections::HashSet;

use docqa_core::config::ConfidenceMethod;
use docqa_core::types::{Chunk, RetrievedChunk};

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on", "or", "that", "the",
    "this", "to", "was", "what", "which", "who", "how", "why", "when", "where", "with", "does", "do",
];

/// Lowercased content words of `text`.
pub fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Share of the question's content words that occur in `text`, in [0, 1].
pub fn term_overlap(question_terms: &HashSet<String>, text: &str) -> f32 {
    if question_terms.is_empty() {
        return 0.0;
    }
    let found = terms(text);
    question_terms.iter().filter(|t| found.contains(*t)).count() as f32 / question_terms.len() as f32
}

/// Divide each score by the largest one so the best lexical hit scores 1.
pub fn normalize_by_max(scores: &mut [(String, f32)]) {
    let max = scores.iter().map(|(_, s)| *s).fold(0.0f32, f32::max);
    if max <= 0.0 {
        return;
    }
    for (_, s) in scores.iter_mut() {
        *s = (*s / max).clamp(0.0, 1.0);
    }
}

pub fn hybrid_score(alpha: f32, vector: f32, lexical: f32) -> f32 {
    alpha * vector + (1.0 - alpha) * lexical
}

/// Descending score, ties broken by chunk id so the order is total.
pub fn sort_ranked(hits: &mut [RetrievedChunk]) {
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id)));
}

/// Bytes between two spans; 0 when they overlap or touch.
fn span_gap(a: &Chunk, b: &Chunk) -> usize {
    a.start_offset.max(b.start_offset).saturating_sub(a.end_offset.min(b.end_offset))
}

/// Keep the best of any same-document chunks whose byte spans overlap, touch
/// or sit at most `max_gap` bytes apart. Input must already be ranked.
pub fn dedup_adjacent(ranked: Vec<RetrievedChunk>, max_gap: usize) -> Vec<RetrievedChunk> {
    let mut kept: Vec<RetrievedChunk> = Vec::with_capacity(ranked.len());
    for hit in ranked {
        let near = kept
            .iter()
            .any(|k| k.chunk.document_id == hit.chunk.document_id && span_gap(&k.chunk, &hit.chunk) <= max_gap);
        if !near {
            kept.push(hit);
        }
    }
    kept
}

/// Confidence of a ranked list: 0 when empty, the top score for a single hit,
/// otherwise per `method`.
pub fn confidence(ranked: &[RetrievedChunk], method: ConfidenceMethod) -> f32 {
    let Some(top) = ranked.first().map(|h| h.score) else {
        return 0.0;
    };
    if ranked.len() == 1 {
        return top.clamp(0.0, 1.0);
    }
    let value = match method {
        ConfidenceMethod::Top => top,
        ConfidenceMethod::Gap => top - ranked[ranked.len() - 1].score,
        ConfidenceMethod::MeanGap => {
            let rest = &ranked[1..];
            top - rest.iter().map(|h| h.score).sum::<f32>() / rest.len() as f32
        }
    };
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(doc: &str, offset: usize, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            chunk: Chunk {
                chunk_id: docqa_core::types::chunk_id(doc, offset),
                document_id: doc.into(),
                text: String::new(),
                page: 1,
                start_offset: offset,
                end_offset: offset + 100,
                subject: "s".into(),
                module: "m".into(),
                filename: "f".into(),
            },
            score,
            vector_score: score,
            lexical_score: 0.0,
        }
    }

    #[test]
    fn overlap_ignores_stop_words_and_case() {
        let q = terms("What is the Second Law of Thermodynamics?");
        assert_eq!(q.len(), 3);
        let s = term_overlap(&q, "the second law (thermodynamics)");
        assert!((s - 1.0).abs() < 1e-6);
        assert_eq!(term_overlap(&q, "photosynthesis"), 0.0);
    }

    #[test]
    fn normalization_tops_out_at_one() {
        let mut s = vec![("a".to_string(), 8.0), ("b".to_string(), 2.0)];
        normalize_by_max(&mut s);
        assert_eq!(s[0].1, 1.0);
        assert_eq!(s[1].1, 0.25);
    }

    #[test]
    fn dedup_keeps_best_of_overlapping_neighbours() {
        let mut ranked = vec![hit("d", 0, 0.9), hit("d", 80, 0.8), hit("d", 1000, 0.7), hit("e", 0, 0.6)];
        sort_ranked(&mut ranked);
        let kept = dedup_adjacent(ranked, 0);
        let ids: Vec<_> = kept.iter().map(|h| h.chunk.chunk_id.as_str()).collect();
        assert_eq!(ids, ["d:0", "d:1000", "e:0"]);
    }

    #[test]
    fn dedup_gap_tolerance() {
        // [0, 100) and [100, 200) touch, [0, 100) and [150, 250) are 50 bytes apart
        let touching = vec![hit("d", 0, 0.9), hit("d", 100, 0.8)];
        assert_eq!(dedup_adjacent(touching, 0).len(), 1);
        let spaced = vec![hit("d", 0, 0.9), hit("d", 150, 0.8)];
        assert_eq!(dedup_adjacent(spaced.clone(), 0).len(), 2);
        assert_eq!(dedup_adjacent(spaced, 50).len(), 1);
    }

    #[test]
    fn confidence_methods() {
        let ranked = vec![hit("a", 0, 0.9), hit("b", 0, 0.5), hit("c", 0, 0.3)];
        assert!((confidence(&ranked, ConfidenceMethod::Gap) - 0.6).abs() < 1e-6);
        assert!((confidence(&ranked, ConfidenceMethod::MeanGap) - 0.5).abs() < 1e-6);
        assert!((confidence(&ranked, ConfidenceMethod::Top) - 0.9).abs() < 1e-6);
        assert_eq!(confidence(&ranked[..1], ConfidenceMethod::Gap), 0.9);
        assert_eq!(confidence(&[], ConfidenceMethod::Gap), 0.0);
    }

    #[test]
    fn ties_break_on_chunk_id() {
        let mut ranked = vec![hit("b", 0, 0.5), hit("a", 0, 0.5)];
        sort_ranked(&mut ranked);
        assert_eq!(ranked[0].chunk.chunk_id, "a:0");
    }
}
