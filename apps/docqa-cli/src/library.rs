//! Loading a plain-text library laid out as `<root>/<subject>/<module>/<file>.txt`.
//!
//! Form feeds (`\x0c`) separate pages, numbered from 1. Files directly under
//! the root or a subject folder land in the `general` subject or module.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use docqa_core::types::{Document, TextSegment};

const GENERAL: &str = "general";
const PAGE_BREAK: char = '\u{0c}';

/// Every `.txt` file under `root`, sorted for a stable ingestion order.
pub fn library_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        anyhow::bail!("library directory not found: {}", root.display());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|e| e.eq_ignore_ascii_case("txt")) {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

pub fn load_document(root: &Path, path: &Path) -> Result<Document> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = rel.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    let (subject, module, filename) = match parts.as_slice() {
        [file] => (GENERAL.to_string(), GENERAL.to_string(), file.clone()),
        [subject, file] => (subject.clone(), GENERAL.to_string(), file.clone()),
        [subject, module, rest @ ..] => (subject.clone(), module.clone(), rest.join("/")),
        [] => anyhow::bail!("not a library file: {}", path.display()),
    };
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Document::new(subject, module, filename, split_pages(&text)))
}

/// Page-numbered segments; blank pages are dropped without renumbering.
pub fn split_pages(text: &str) -> Vec<TextSegment> {
    text.split(PAGE_BREAK)
        .zip(1u32..)
        .filter(|(page, _)| !page.trim().is_empty())
        .map(|(page, n)| TextSegment::new(page, n))
        .collect()
}

pub fn load_library(root: &Path) -> Result<Vec<Document>> {
    library_files(root)?.iter().map(|p| load_document(root, p)).collect()
}
