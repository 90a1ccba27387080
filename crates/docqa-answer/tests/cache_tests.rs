#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::oneshot;

use docqa_answer::{AnswerCache, CacheKey, Computed, Origin};
use docqa_core::config::CacheSettings;
use docqa_core::traits::CorpusObserver;
use docqa_core::types::{chunk_id, Chunk, Engine, RetrievalResult, RetrievedChunk};
use docqa_core::Error;

fn retrieval(document_id: &str, offsets: &[usize]) -> RetrievalResult {
    let hits = offsets
        .iter()
        .map(|&o| RetrievedChunk {
            chunk: Chunk {
                chunk_id: chunk_id(document_id, o),
                document_id: document_id.to_string(),
                text: format!("text at {o}"),
                page: 1,
                start_offset: o,
                end_offset: o + 10,
                subject: "physics".into(),
                module: "thermo".into(),
                filename: "notes.txt".into(),
            },
            score: 0.5,
            vector_score: 0.5,
            lexical_score: 0.5,
        })
        .collect();
    RetrievalResult { hits, confidence: 0.2 }
}

fn key(question: &str, r: &RetrievalResult) -> CacheKey {
    CacheKey::new(question, r, Engine::Local, "mistral", None)
}

fn answer(text: &str) -> Computed {
    Computed { answer_text: text.to_string(), engine: Engine::Local, cacheable: true }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_computation() {
    let cache = AnswerCache::in_memory();
    let r = retrieval("physics/thermo/notes.txt", &[0, 120]);
    let k = key("What is entropy?", &r);
    let calls = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let (cache, r, k, calls) = (cache.clone(), r.clone(), k.clone(), calls.clone());
        tasks.push(tokio::spawn(async move {
            cache
                .get_or_compute(&k, &r, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(answer("Entropy never decreases."))
                })
                .await
        }));
    }
    let mut computed = 0;
    for t in tasks {
        let (entry, origin) = t.await.unwrap().unwrap();
        assert_eq!(entry.answer_text, "Entropy never decreases.");
        if origin == Origin::Computed {
            computed += 1;
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(computed, 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn failures_are_not_cached() {
    let cache = AnswerCache::in_memory();
    let r = retrieval("d", &[0]);
    let k = key("q", &r);
    let err = cache
        .get_or_compute(&k, &r, || async { Err(Error::ModelTimeout { engine: Engine::Local, seconds: 1 }) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ModelTimeout { .. }));
    assert!(cache.get(&k).is_none());

    let (_, origin) = cache.get_or_compute(&k, &r, || async { Ok(answer("a")) }).await.unwrap();
    assert_eq!(origin, Origin::Computed);
    let (_, origin) = cache.get_or_compute(&k, &r, || async { Ok(answer("b")) }).await.unwrap();
    assert_eq!(origin, Origin::Hit);
}

#[tokio::test]
async fn uncacheable_results_are_returned_but_not_kept() {
    let cache = AnswerCache::in_memory();
    let r = retrieval("d", &[0]);
    let k = key("q", &r);
    let (entry, _) = cache
        .get_or_compute(&k, &r, || async {
            Ok(Computed { answer_text: "fallback".into(), engine: Engine::Local, cacheable: false })
        })
        .await
        .unwrap();
    assert_eq!(entry.answer_text, "fallback");
    assert!(cache.is_empty());
}

#[tokio::test]
async fn invalidation_by_document_and_chunk() {
    let cache = AnswerCache::in_memory();
    let thermo = retrieval("physics/thermo/notes.txt", &[0, 120]);
    let optics = retrieval("physics/optics/lenses.txt", &[0]);
    for (q, r) in [("entropy", &thermo), ("lenses", &optics)] {
        cache.get_or_compute(&key(q, r), r, move || async move { Ok(answer(q)) }).await.unwrap();
    }
    assert_eq!(cache.len(), 2);

    assert_eq!(cache.invalidate_chunks(&[chunk_id("physics/thermo/notes.txt", 120)]), 1);
    assert!(cache.get(&key("entropy", &thermo)).is_none());
    assert!(cache.get(&key("lenses", &optics)).is_some());

    assert_eq!(cache.invalidate_document("physics/optics/lenses.txt"), 1);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn corpus_change_during_computation_skips_the_write() {
    let cache = AnswerCache::in_memory();
    let r = retrieval("physics/thermo/notes.txt", &[0]);
    let k = key("entropy", &r);
    let (release, gate) = oneshot::channel::<()>();

    let task = {
        let (cache, r, k) = (cache.clone(), r.clone(), k.clone());
        tokio::spawn(async move {
            cache
                .get_or_compute(&k, &r, move || async move {
                    let _ = gate.await;
                    Ok(answer("stale"))
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cache.chunks_changed("physics/thermo/notes.txt", &[chunk_id("physics/thermo/notes.txt", 0)]);
    release.send(()).unwrap();

    let (entry, origin) = task.await.unwrap().unwrap();
    assert_eq!(entry.answer_text, "stale");
    assert_eq!(origin, Origin::Computed);
    assert!(cache.get(&k).is_none());
}

#[tokio::test]
async fn clear_drops_everything() {
    let cache = AnswerCache::in_memory();
    let r = retrieval("d", &[0]);
    cache.get_or_compute(&key("q", &r), &r, || async { Ok(answer("a")) }).await.unwrap();
    cache.corpus_cleared();
    assert!(cache.is_empty());
}

#[tokio::test]
async fn zero_ttl_expires_immediately() {
    let cache = AnswerCache::open(&CacheSettings { ttl_secs: Some(0), ..CacheSettings::default() }).unwrap();
    let r = retrieval("d", &[0]);
    let k = key("q", &r);
    cache.get_or_compute(&k, &r, || async { Ok(answer("a")) }).await.unwrap();
    let (_, origin) = cache.get_or_compute(&k, &r, || async { Ok(answer("b")) }).await.unwrap();
    assert_eq!(origin, Origin::Computed);
}

#[tokio::test]
async fn expired_entries_are_reclaimed_without_lookup() {
    let cache = AnswerCache::open(&CacheSettings { ttl_secs: Some(0), ..CacheSettings::default() }).unwrap();
    for i in 0..200 {
        let r = retrieval(&format!("doc-{i}"), &[0]);
        cache.get_or_compute(&key(&format!("q{i}"), &r), &r, || async { Ok(answer("a")) }).await.unwrap();
    }
    assert_eq!(cache.len(), 0);
}

#[tokio::test]
async fn capacity_bounds_the_cache() {
    let cache = AnswerCache::open(&CacheSettings { max_entries: 8, ..CacheSettings::default() }).unwrap();
    for i in 0..200 {
        let r = retrieval(&format!("doc-{i}"), &[0]);
        cache.get_or_compute(&key(&format!("q{i}"), &r), &r, || async { Ok(answer("a")) }).await.unwrap();
    }
    assert!(cache.len() <= 8, "len = {}", cache.len());
}

#[tokio::test]
async fn expired_files_are_removed_on_reclaim() {
    let dir = TempDir::new().unwrap();
    let settings = CacheSettings {
        dir: Some(dir.path().to_string_lossy().into_owned()),
        ttl_secs: Some(1),
        ..CacheSettings::default()
    };
    let cache = AnswerCache::open(&settings).unwrap();
    let r = retrieval("physics/thermo/notes.txt", &[0]);
    let k = key("entropy", &r);
    cache.get_or_compute(&k, &r, || async { Ok(answer("short lived")) }).await.unwrap();
    let file = dir.path().join(format!("{}.json", k.as_str()));
    assert!(file.exists());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(cache.len(), 0);
    assert!(!file.exists());
}

#[tokio::test]
async fn entries_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let settings = CacheSettings { dir: Some(dir.path().to_string_lossy().into_owned()), ..CacheSettings::default() };
    let r = retrieval("physics/thermo/notes.txt", &[0]);
    let k = key("entropy", &r);
    {
        let cache = AnswerCache::open(&settings).unwrap();
        cache.get_or_compute(&k, &r, || async { Ok(answer("persisted")) }).await.unwrap();
    }
    assert!(dir.path().join(format!("{}.json", k.as_str())).exists());

    let cache = AnswerCache::open(&settings).unwrap();
    let entry = cache.get(&k).unwrap();
    assert_eq!(entry.answer_text, "persisted");
    assert_eq!(entry.source_document_ids, vec!["physics/thermo/notes.txt".to_string()]);

    cache.invalidate_document("physics/thermo/notes.txt");
    assert!(!dir.path().join(format!("{}.json", k.as_str())).exists());
}

#[tokio::test]
async fn malformed_files_are_misses() {
    let dir = TempDir::new().unwrap();
    let bad = dir.path().join("0badc0de.json");
    std::fs::write(&bad, b"{ not json").unwrap();
    let settings = CacheSettings { dir: Some(dir.path().to_string_lossy().into_owned()), ..CacheSettings::default() };

    let cache = AnswerCache::open(&settings).unwrap();
    assert!(cache.is_empty());
    assert!(!bad.exists());
}
