//! Batch answering of a question paper into a solution sheet.
//!
//! Questions are pulled out of plain text by their markers (`Q1.`,
//! `Question 2:`) or by a numbered list (`3)`, `4.`), cleaned of marks and
//! page furniture, then answered one by one. A failed question is written
//! to the sheet with its error and does not stop the run.

use anyhow::Result;
use chrono::Local;
use regex::Regex;
use std::collections::HashSet;
use std::io::Write;
use std::sync::LazyLock;
use tracing::{info, warn};

use docqa_answer::Orchestrator;
use docqa_core::types::{AskRequest, Engine, SearchFilter};

static RE_MARKED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ims)^\s*(?:Q\.?|Question)\s*(\d+)\s*[:.)]?\s*(.+?)(?:^\s*(?:Q\.?|Question)\s*\d+|\z)")
        .expect("static regex")
});
static RE_NUMBERED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(\d+)[.)]\s*(.+)").expect("static regex"));
static RE_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));
static RE_FURNITURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)page\s+\d+(?:\s+of\s+\d+)?|[\[(]\s*\d+\s*(?:marks?|points?)\s*[\])]").expect("static regex")
});
static RE_NOT_A_QUESTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:(?:page|figure|table|diagram|image)\s+\d+|(?:time|duration|total marks|instructions?|note|guidelines?)\s*:|university|college|department)",
    )
    .expect("static regex")
});

const MIN_QUESTION_CHARS: usize = 20;
const MAX_QUESTION_CHARS: usize = 1000;
const RULE: &str = "================================================================================";
const THIN_RULE: &str = "--------------------------------------------------------------------------------";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaperQuestion {
    /// Number printed on the paper, when there was one.
    pub number: Option<String>,
    pub text: String,
}

pub fn clean_question(text: &str) -> String {
    let text = RE_FURNITURE.replace_all(text, " ");
    RE_SPACE.replace_all(&text, " ").trim().to_string()
}

fn is_question(text: &str) -> bool {
    let len = text.chars().count();
    (MIN_QUESTION_CHARS..=MAX_QUESTION_CHARS).contains(&len)
        && text.chars().filter(char::is_ascii_alphabetic).count() >= 3
        && !RE_NOT_A_QUESTION.is_match(text)
}

#[derive(Default)]
struct Collected {
    seen: HashSet<String>,
    questions: Vec<PaperQuestion>,
}

impl Collected {
    fn push(&mut self, number: &str, raw: &str) {
        let text = clean_question(raw);
        if is_question(&text) && self.seen.insert(text.clone()) {
            self.questions.push(PaperQuestion { number: Some(number.to_string()), text });
        }
    }
}

/// Questions in paper order. Explicit `Q`/`Question` markers win; a paper
/// without them is read as a numbered list.
pub fn extract_questions(paper: &str) -> Vec<PaperQuestion> {
    let mut found = Collected::default();

    // the marker pattern consumes the next marker, so walk it by hand
    let mut at = 0;
    while let Some(caps) = RE_MARKED.captures_at(paper, at) {
        let (Some(number), Some(body)) = (caps.get(1), caps.get(2)) else { break };
        found.push(number.as_str(), body.as_str());
        at = body.end();
    }
    if !found.questions.is_empty() {
        return found.questions;
    }

    let mut current: Option<(String, String)> = None;
    for line in paper.lines() {
        if let Some(caps) = RE_NUMBERED.captures(line) {
            if let Some((n, body)) = current.take() {
                found.push(&n, &body);
            }
            current = Some((caps[1].to_string(), caps[2].to_string()));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(' ');
            body.push_str(line.trim());
        }
    }
    if let Some((n, body)) = current {
        found.push(&n, &body);
    }
    found.questions
}

#[derive(Debug, Clone, Default)]
pub struct SolveOptions {
    pub paper_name: String,
    pub use_cloud: bool,
    pub filter: SearchFilter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SolveSummary {
    pub solved: usize,
    pub failed: usize,
}

/// Answer every question and write the sheet to `out`. `progress` is told
/// about each question as it finishes.
pub async fn solve<W: Write>(
    orchestrator: &Orchestrator,
    questions: &[PaperQuestion],
    options: &SolveOptions,
    out: &mut W,
    mut progress: impl FnMut(usize, &PaperQuestion, bool),
) -> Result<SolveSummary> {
    writeln!(out, "{RULE}\nSOLUTION SHEET\n{RULE}\n")?;
    writeln!(out, "Question paper: {}", options.paper_name)?;
    writeln!(out, "Total questions: {}", questions.len())?;
    writeln!(out, "Cloud enabled: {}", if options.use_cloud { "yes" } else { "no" })?;
    writeln!(out, "Generated on: {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"))?;

    let mut summary = SolveSummary::default();
    for (i, q) in questions.iter().enumerate() {
        writeln!(out, "{RULE}\nQUESTION {}", i + 1)?;
        if let Some(n) = &q.number {
            writeln!(out, "Original number: {n}")?;
        }
        writeln!(out, "{THIN_RULE}\n{}\n{THIN_RULE}\nANSWER:\n", q.text)?;

        let request = AskRequest::new(q.text.clone()).with_cloud(options.use_cloud).with_filter(options.filter.clone());
        let ok = match orchestrator.ask(request).await {
            Ok(response) => {
                writeln!(out, "{}\n", response.answer_text.trim())?;
                for (k, s) in response.sources.iter().enumerate() {
                    writeln!(out, "  [{}] {} (page {})", k + 1, s.document_id, s.page)?;
                }
                let engine = response.engine_used.map_or("none", Engine::as_str);
                writeln!(out, "Engine: {engine}  Confidence: {:.3}", response.confidence)?;
                summary.solved += 1;
                true
            }
            Err(e) => {
                warn!(question = i + 1, error = %e, "question failed");
                writeln!(out, "ERROR: {e}")?;
                summary.failed += 1;
                false
            }
        };
        writeln!(out, "{RULE}\n")?;
        progress(i + 1, q, ok);
    }
    out.flush()?;
    info!(solved = summary.solved, failed = summary.failed, "question paper done");
    Ok(summary)
}
