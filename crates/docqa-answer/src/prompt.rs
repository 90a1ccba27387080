//! System and user prompt construction for both engines.
//!
//! Local prompts carry every retrieved excerpt in full under a numbered header
//! (`[n] file | subject / module (page p)`). Cloud prompts are built only from
//! [`SanitizedText`], and the resulting [`Prompt`] remembers that; the cloud
//! backend refuses anything else.

use std::fmt::Write as _;
use tracing::debug;

use docqa_core::types::{Engine, RetrievedChunk};

use crate::sanitize::{CloudExcerpt, SanitizedText};

const NO_CONTEXT: &str = "(no matching excerpts were found in the library)";
const UNGROUNDED_NOTE: &str = " No excerpts from the library matched this question; say so plainly \
     before giving any general answer, and do not invent sources.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    system: String,
    user: String,
    model: Option<String>,
    sanitized: bool,
}

impl Prompt {
    /// A prompt from raw text. Cloud backends will refuse it.
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self { system: system.into(), user: user.into(), model: None, sanitized: false }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// True only for prompts assembled by [`cloud_prompt`].
    pub fn is_sanitized(&self) -> bool {
        self.sanitized
    }
}

/// Persona selected by the `agent` hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persona {
    Tutor,
    StudyPartner,
    Examiner,
    Summarizer,
}

impl Persona {
    /// Unknown or missing hints fall back to the engine's default persona.
    pub fn from_hint(hint: Option<&str>, engine: Engine) -> Self {
        let default = match engine {
            Engine::Local => Persona::Tutor,
            Engine::Cloud => Persona::StudyPartner,
        };
        let Some(hint) = hint else { return default };
        match hint.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "tutor" => Persona::Tutor,
            "study_partner" | "partner" => Persona::StudyPartner,
            "examiner" | "exam" => Persona::Examiner,
            "summarizer" | "summary" => Persona::Summarizer,
            other => {
                debug!(agent = other, "unknown agent hint, using default persona");
                default
            }
        }
    }

    fn system_prompt(self) -> &'static str {
        match self {
            Persona::Tutor => {
                "You are an expert engineering tutor. Use the provided context to answer the question \
                 accurately and concisely, citing excerpts by their [n] number. If the context doesn't \
                 contain enough information, say so."
            }
            Persona::StudyPartner => {
                "You are an expert AI study partner. Answer the question using ONLY the provided \
                 context and cite sources by number. Be clear, accurate, and helpful."
            }
            Persona::Examiner => {
                "You are an examiner. Write a model exam answer to the question using only the provided \
                 context, then list the key points a grader would look for, citing sources by number."
            }
            Persona::Summarizer => {
                "You summarize course material. Using only the provided context, give a short bullet \
                 summary of what it says about the question, citing sources by number."
            }
        }
    }
}

/// Local prompt with every retrieved excerpt in full.
pub fn local_prompt(question: &str, hits: &[RetrievedChunk], agent: Option<&str>) -> Prompt {
    let mut context = String::new();
    for (i, h) in hits.iter().enumerate() {
        let c = &h.chunk;
        if i > 0 {
            context.push_str("\n\n");
        }
        let _ = write!(context, "[{}] {} | {} / {} (page {})\n{}", i + 1, c.filename, c.subject, c.module, c.page, c.text);
    }
    let persona = Persona::from_hint(agent, Engine::Local);
    Prompt::new(system_text(persona, hits.is_empty()), user_text(&context, question))
}

/// Cloud prompt assembled only from sanitized pieces.
pub fn cloud_prompt(question: &SanitizedText, excerpts: &[CloudExcerpt], agent: Option<&str>) -> Prompt {
    let mut context = String::new();
    for (i, e) in excerpts.iter().enumerate() {
        if i > 0 {
            context.push_str("\n\n");
        }
        let _ = write!(context, "Source {} ({}, page {}):\n{}", i + 1, e.filename, e.chunk.page, e.text);
    }
    let persona = Persona::from_hint(agent, Engine::Cloud);
    Prompt {
        system: system_text(persona, excerpts.is_empty()),
        user: user_text(&context, question.as_str()),
        model: None,
        sanitized: true,
    }
}

fn system_text(persona: Persona, ungrounded: bool) -> String {
    let mut s = persona.system_prompt().to_string();
    if ungrounded {
        s.push_str(UNGROUNDED_NOTE);
    }
    s
}

fn user_text(context: &str, question: &str) -> String {
    let context = if context.is_empty() { NO_CONTEXT } else { context };
    format!("CONTEXT:\n{context}\n\nQUESTION: {question}\n\nANSWER:")
}
