#![allow(clippy::unwrap_used)]

mod common;

use futures::StreamExt;
use std::time::Duration;

use docqa_answer::{StreamEvent, DECLINED_ANSWER};
use docqa_core::config::{RoutingSettings, UngroundedPolicy};
use docqa_core::types::{AskHints, AskRequest, Document, Engine, RoutingReason, TextSegment};
use docqa_core::Error;

use common::{fast_routing, harness, library, ScriptedBackend, QUESTION, THERMO_DOC};

const LOCAL_ANSWER: &str = "Entropy of an isolated system never decreases [1].";
const CLOUD_ANSWER: &str = "In an isolated system entropy increases (Source 1).";

/// Confidence never reaches this, so enabled cloud always wins.
fn cloud_preferred() -> RoutingSettings {
    RoutingSettings { confidence_threshold: 1.0, ..fast_routing() }
}

#[tokio::test]
async fn answers_locally_and_cites_the_grounding_page() {
    let h = harness(ScriptedBackend::local(LOCAL_ANSWER), None, RoutingSettings::default());
    h.ingestor.ingest_all(&library()).await.unwrap();

    let r = h.orchestrator.ask(AskRequest::new(QUESTION)).await.unwrap();
    assert_eq!(r.answer_text, LOCAL_ANSWER);
    assert_eq!(r.engine_used, Some(Engine::Local));
    assert_eq!(r.routing.unwrap().reason, RoutingReason::CloudDisabled);
    assert!(!r.cached);
    assert_eq!(r.sources[0].page, 12);
    assert_eq!(r.sources[0].document_id, THERMO_DOC);
    assert!(r.confidence > 0.0);

    let prompt = h.local.last_prompt().unwrap();
    assert!(prompt.user().contains("Second Law of Thermodynamics"));
    assert!(prompt.user().contains("(page 12)"));

    let again = h.orchestrator.ask(AskRequest::new("what is the second law of   thermodynamics")).await.unwrap();
    assert!(again.cached);
    assert_eq!(again.answer_text, LOCAL_ANSWER);
    assert_eq!(h.local.calls(), 1);
}

#[tokio::test]
async fn empty_library_declines_without_a_model_call() {
    let h = harness(ScriptedBackend::local(LOCAL_ANSWER), None, RoutingSettings::default());
    let r = h.orchestrator.ask(AskRequest::new(QUESTION)).await.unwrap();
    assert_eq!(r.answer_text, DECLINED_ANSWER);
    assert!(r.sources.is_empty());
    assert_eq!(r.confidence, 0.0);
    assert_eq!(r.engine_used, None);
    assert_eq!(h.local.calls(), 0);
}

#[tokio::test]
async fn empty_library_answers_ungrounded_when_allowed() {
    let routing = RoutingSettings { ungrounded_policy: UngroundedPolicy::Answer, ..RoutingSettings::default() };
    let h = harness(ScriptedBackend::local("I could not find this in your library."), None, routing);
    let r = h.orchestrator.ask(AskRequest::new(QUESTION)).await.unwrap();
    assert!(r.sources.is_empty());
    assert_eq!(r.confidence, 0.0);
    assert_eq!(r.engine_used, Some(Engine::Local));
    assert!(h.local.last_prompt().unwrap().system().contains("No excerpts from the library matched"));
}

#[tokio::test]
async fn blank_question_is_rejected() {
    let h = harness(ScriptedBackend::local(LOCAL_ANSWER), None, RoutingSettings::default());
    let err = h.orchestrator.ask(AskRequest::new("  \n ")).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn weak_context_goes_to_cloud_with_sanitized_payload() {
    let h = harness(
        ScriptedBackend::local(LOCAL_ANSWER),
        Some(ScriptedBackend::cloud(CLOUD_ANSWER)),
        cloud_preferred(),
    );
    let doc = Document::new(
        "physics",
        "thermodynamics",
        "office-hours.txt",
        vec![TextSegment::new("Email smith@uni.edu or call 555-123-4567 with entropy questions.", 2)],
    );
    h.ingestor.ingest_all(&library()).await.unwrap();
    h.ingestor.ingest(&doc).await.unwrap();

    let request = AskRequest::new("Who do I email at smith@uni.edu about entropy in an isolated system?").with_cloud(true);
    let r = h.orchestrator.ask(request).await.unwrap();
    assert_eq!(r.engine_used, Some(Engine::Cloud));
    assert_eq!(r.answer_text, CLOUD_ANSWER);
    assert_eq!(h.local.calls(), 0);

    let prompt = h.cloud.as_ref().unwrap().last_prompt().unwrap();
    assert!(prompt.is_sanitized());
    assert!(!prompt.user().contains('@'));
    assert!(!prompt.user().contains("555-123-4567"));
    assert!(prompt.user().contains("[REDACTED_EMAIL]"));
}

#[tokio::test(flavor = "multi_thread")]
async fn cloud_timeout_falls_back_to_local() {
    let h = harness(
        ScriptedBackend::local(LOCAL_ANSWER),
        Some(ScriptedBackend::cloud(CLOUD_ANSWER).hanging()),
        cloud_preferred(),
    );
    h.ingestor.ingest_all(&library()).await.unwrap();

    let r = h.orchestrator.ask(AskRequest::new(QUESTION).with_cloud(true)).await.unwrap();
    assert_eq!(r.engine_used, Some(Engine::Local));
    assert_eq!(r.answer_text, LOCAL_ANSWER);
    let routing = r.routing.unwrap();
    assert_eq!(routing.engine, Engine::Local);
    assert_eq!(routing.reason, RoutingReason::CloudUnavailableFallback);
    assert_eq!(h.cloud.as_ref().unwrap().calls(), 1);
    // fallback answers are not remembered under the cloud key
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn cloud_outage_falls_back_to_local() {
    let cloud = ScriptedBackend::cloud(CLOUD_ANSWER).failing(Error::unavailable(Engine::Cloud, "503"));
    let h = harness(ScriptedBackend::local(LOCAL_ANSWER), Some(cloud), cloud_preferred());
    h.ingestor.ingest_all(&library()).await.unwrap();
    let r = h.orchestrator.ask(AskRequest::new(QUESTION).with_cloud(true)).await.unwrap();
    assert_eq!(r.engine_used, Some(Engine::Local));
    assert_eq!(h.local.calls(), 1);
}

#[tokio::test]
async fn sanitization_failure_is_not_a_fallback() {
    let cloud =
        ScriptedBackend::cloud(CLOUD_ANSWER).failing(Error::SanitizationBypassAttempt("payload still contains: email".into()));
    let h = harness(ScriptedBackend::local(LOCAL_ANSWER), Some(cloud), cloud_preferred());
    h.ingestor.ingest_all(&library()).await.unwrap();
    let err = h.orchestrator.ask(AskRequest::new(QUESTION).with_cloud(true)).await.unwrap_err();
    assert!(matches!(err, Error::SanitizationBypassAttempt(_)));
    assert_eq!(h.local.calls(), 0);
}

#[tokio::test]
async fn forced_local_ignores_cloud() {
    let h = harness(
        ScriptedBackend::local(LOCAL_ANSWER),
        Some(ScriptedBackend::cloud(CLOUD_ANSWER)),
        cloud_preferred(),
    );
    h.ingestor.ingest_all(&library()).await.unwrap();
    let hints = AskHints { engine: Some(Engine::Local), ..AskHints::default() };
    let r = h.orchestrator.ask(AskRequest::new(QUESTION).with_cloud(true).with_hints(hints)).await.unwrap();
    assert_eq!(r.routing.unwrap().reason, RoutingReason::UserForced);
    assert_eq!(h.cloud.as_ref().unwrap().calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_questions_share_one_generation() {
    let local = ScriptedBackend::local(LOCAL_ANSWER).with_delay(Duration::from_millis(30));
    let h = harness(local, None, RoutingSettings::default());
    h.ingestor.ingest_all(&library()).await.unwrap();

    let a = h.orchestrator.clone();
    let b = h.orchestrator.clone();
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { a.ask(AskRequest::new(QUESTION)).await }),
        tokio::spawn(async move { b.ask(AskRequest::new(QUESTION)).await }),
    );
    let (ra, rb) = (ra.unwrap().unwrap(), rb.unwrap().unwrap());
    assert_eq!(ra.answer_text, rb.answer_text);
    assert_eq!(h.local.calls(), 1);
    assert_eq!([ra.cached, rb.cached].iter().filter(|c| **c).count(), 1);
}

#[tokio::test]
async fn failed_generation_does_not_poison_the_key() {
    let h = harness(ScriptedBackend::local(LOCAL_ANSWER).fail_first(1), None, RoutingSettings::default());
    h.ingestor.ingest_all(&library()).await.unwrap();
    let err = h.orchestrator.ask(AskRequest::new(QUESTION)).await.unwrap_err();
    assert!(matches!(err, Error::ModelUnavailable { engine: Engine::Local, .. }));
    assert!(h.cache.is_empty());

    let r = h.orchestrator.ask(AskRequest::new(QUESTION)).await.unwrap();
    assert_eq!(r.answer_text, LOCAL_ANSWER);
    assert!(!r.cached);
    assert_eq!(h.local.calls(), 2);
}

#[tokio::test]
async fn reingesting_a_source_evicts_its_answers() {
    let h = harness(ScriptedBackend::local(LOCAL_ANSWER), None, RoutingSettings::default());
    h.ingestor.ingest_all(&library()).await.unwrap();
    h.orchestrator.ask(AskRequest::new(QUESTION)).await.unwrap();
    assert_eq!(h.cache.len(), 1);

    let edited = Document::new(
        "physics",
        "thermodynamics",
        "lecture-3.txt",
        vec![TextSegment::new("The entropy of an isolated system never decreases (Second Law of Thermodynamics).", 12)],
    );
    h.ingestor.ingest(&edited).await.unwrap();
    assert!(h.cache.is_empty());

    let r = h.orchestrator.ask(AskRequest::new(QUESTION)).await.unwrap();
    assert!(!r.cached);
    assert_eq!(h.local.calls(), 2);
}

#[tokio::test]
async fn explicit_invalidate_and_clear() {
    let h = harness(ScriptedBackend::local(LOCAL_ANSWER), None, RoutingSettings::default());
    h.ingestor.ingest_all(&library()).await.unwrap();
    h.orchestrator.ask(AskRequest::new(QUESTION)).await.unwrap();
    assert_eq!(h.orchestrator.invalidate("chemistry/acids/ph.txt"), 0);
    assert_eq!(h.orchestrator.invalidate(THERMO_DOC), 1);

    h.orchestrator.ask(AskRequest::new(QUESTION)).await.unwrap();
    h.orchestrator.clear();
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn stream_yields_fragments_then_summary() {
    let h = harness(ScriptedBackend::local(LOCAL_ANSWER), None, RoutingSettings::default());
    h.ingestor.ingest_all(&library()).await.unwrap();

    let events: Vec<StreamEvent> = h.orchestrator.ask_stream(AskRequest::new(QUESTION)).collect().await;
    let (last, fragments) = events.split_last().unwrap();
    let text: String = fragments
        .iter()
        .map(|e| match e {
            StreamEvent::Fragment(f) => f.as_str(),
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert!(fragments.len() > 1);
    assert_eq!(text, LOCAL_ANSWER);
    match last {
        StreamEvent::Done(r) => {
            assert_eq!(r.answer_text, LOCAL_ANSWER);
            assert!(!r.cached);
            assert_eq!(r.sources[0].page, 12);
        }
        other => panic!("expected Done, got {other:?}"),
    }

    // a cache hit arrives as a single fragment
    let events: Vec<StreamEvent> = h.orchestrator.ask_stream(AskRequest::new(QUESTION)).collect().await;
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[1], StreamEvent::Done(r) if r.cached));
}

#[tokio::test]
async fn stream_errors_end_with_error_event() {
    let h = harness(
        ScriptedBackend::local(LOCAL_ANSWER).failing(Error::unavailable(Engine::Local, "connection refused")),
        None,
        RoutingSettings::default(),
    );
    h.ingestor.ingest_all(&library()).await.unwrap();
    let events: Vec<StreamEvent> = h.orchestrator.ask_stream(AskRequest::new(QUESTION)).collect().await;
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], StreamEvent::Error(Error::ModelUnavailable { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_the_stream_cancels_without_caching() {
    let slow = ScriptedBackend::local("one two three four five six seven eight").with_delay(Duration::from_millis(100));
    let h = harness(slow, None, RoutingSettings::default());
    h.ingestor.ingest_all(&library()).await.unwrap();

    let mut stream = h.orchestrator.ask_stream(AskRequest::new(QUESTION));
    assert!(matches!(stream.next().await, Some(StreamEvent::Fragment(_))));
    drop(stream);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(h.local.completed(), 0);
    assert!(h.cache.is_empty());

    // the abandoned slot does not block the next caller
    let r = h.orchestrator.ask(AskRequest::new(QUESTION)).await.unwrap();
    assert!(!r.cached);
    assert_eq!(h.local.calls(), 2);
    assert_eq!(h.local.completed(), 1);
}
