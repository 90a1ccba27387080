//! Question answering state machine.
//!
//! ```text
//! Received -> Retrieving -> CacheCheck -> CacheHit -> Done
//!                                      \-> Routing -> LocalGenerate ----------> Streaming -> Done
//!                                                  \-> CloudGenerate -> Fallback -/
//! ```
//!
//! Any stage can end in `Error`. The fallback edge is taken only when the
//! cloud backend times out or is unreachable before it produced a fragment;
//! once text has reached the caller a failure is surfaced instead.

use futures::stream::{self, BoxStream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use docqa_core::config::{RoutingSettings, UngroundedPolicy};
use docqa_core::types::{AskHints, AskRequest, AskResponse, Engine, RetrievalResult, RoutingDecision, RoutingReason};
use docqa_core::{Error, Result};
use docqa_hybrid::Retriever;

use crate::backend::ModelBackend;
use crate::cache::{AnswerCache, CacheKey, Computed, Origin};
use crate::prompt::{cloud_prompt, local_prompt, Prompt};
use crate::sanitize::Sanitizer;

/// Fixed reply for questions with no supporting context under
/// [`UngroundedPolicy::Decline`].
pub const DECLINED_ANSWER: &str = "No relevant information found in the library.";

const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Retrieving,
    CacheCheck,
    CacheHit,
    Routing,
    LocalGenerate,
    CloudGenerate,
    Fallback,
    Streaming,
    Done,
    Error,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Retrieving => "retrieving",
            Stage::CacheCheck => "cache_check",
            Stage::CacheHit => "cache_hit",
            Stage::Routing => "routing",
            Stage::LocalGenerate => "local_generate",
            Stage::CloudGenerate => "cloud_generate",
            Stage::Fallback => "fallback",
            Stage::Streaming => "streaming",
            Stage::Done => "done",
            Stage::Error => "error",
        };
        f.write_str(name)
    }
}

fn enter(stage: Stage) {
    debug!(%stage, "stage");
}

/// Everything the routing rule looks at.
#[derive(Debug, Clone, Copy)]
pub struct RouteInputs {
    pub confidence: f32,
    pub threshold: f32,
    /// Cloud enabled for this request, by the caller or by default.
    pub use_cloud: bool,
    pub forced: Option<Engine>,
    pub cloud_configured: bool,
    pub local_available: bool,
}

/// Local when confident or when cloud is off or unconfigured; cloud for weak
/// context when the caller allows it. A forced engine wins unless it is an
/// unconfigured cloud.
pub fn decide_route(inputs: &RouteInputs) -> RoutingDecision {
    let decision = |engine, reason| RoutingDecision { engine, reason };
    match inputs.forced {
        Some(Engine::Local) => return decision(Engine::Local, RoutingReason::UserForced),
        Some(Engine::Cloud) if inputs.cloud_configured => return decision(Engine::Cloud, RoutingReason::UserForced),
        Some(Engine::Cloud) => return decision(Engine::Local, RoutingReason::CloudUnavailableFallback),
        None => {}
    }
    if !inputs.use_cloud {
        return decision(Engine::Local, RoutingReason::CloudDisabled);
    }
    if !inputs.cloud_configured {
        return decision(Engine::Local, RoutingReason::CloudUnavailableFallback);
    }
    if inputs.confidence >= inputs.threshold && inputs.local_available {
        decision(Engine::Local, RoutingReason::Confidence)
    } else {
        decision(Engine::Cloud, RoutingReason::Confidence)
    }
}

/// Item of [`Orchestrator::ask_stream`]: fragments, then exactly one
/// terminal `Done` or `Error`.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Fragment(String),
    Done(AskResponse),
    Error(Error),
}

type Sink = mpsc::Sender<StreamEvent>;

struct Inner {
    retriever: Retriever,
    cache: AnswerCache,
    sanitizer: Arc<Sanitizer>,
    local: Arc<dyn ModelBackend>,
    cloud: Option<Arc<dyn ModelBackend>>,
    settings: RoutingSettings,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        retriever: Retriever,
        cache: AnswerCache,
        sanitizer: Arc<Sanitizer>,
        local: Arc<dyn ModelBackend>,
        cloud: Option<Arc<dyn ModelBackend>>,
        settings: RoutingSettings,
    ) -> Self {
        Self { inner: Arc::new(Inner { retriever, cache, sanitizer, local, cloud, settings }) }
    }

    pub fn cache(&self) -> &AnswerCache {
        &self.inner.cache
    }

    pub fn cloud_configured(&self) -> bool {
        self.inner.cloud.is_some()
    }

    pub async fn ask(&self, request: AskRequest) -> Result<AskResponse> {
        self.run(request, None).await
    }

    /// Streaming variant of [`ask`](Self::ask). Dropping the stream cancels
    /// generation; a cancelled answer is never cached.
    pub fn ask_stream(&self, request: AskRequest) -> BoxStream<'static, StreamEvent> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                res = this.run(request, Some(&tx)) => Some(res),
                () = tx.closed() => None,
            };
            match outcome {
                Some(Ok(response)) => {
                    let _ = tx.send(StreamEvent::Done(response)).await;
                }
                Some(Err(e)) => {
                    let _ = tx.send(StreamEvent::Error(e)).await;
                }
                None => debug!("stream receiver dropped, generation cancelled"),
            }
        });
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) }).boxed()
    }

    /// Drop cached answers grounded in `document_id`.
    pub fn invalidate(&self, document_id: &str) -> usize {
        self.inner.cache.invalidate_document(document_id)
    }

    pub fn clear(&self) {
        self.inner.cache.clear();
    }

    async fn run(&self, request: AskRequest, sink: Option<&Sink>) -> Result<AskResponse> {
        match self.answer(request, sink).await {
            Ok(response) => {
                enter(Stage::Done);
                Ok(response)
            }
            Err(e) => {
                warn!(stage = %Stage::Error, error = %e, "ask failed");
                Err(e)
            }
        }
    }

    async fn answer(&self, request: AskRequest, sink: Option<&Sink>) -> Result<AskResponse> {
        enter(Stage::Received);
        let question = request.question.trim().to_string();
        if question.is_empty() {
            return Err(Error::InvalidInput("question is empty".into()));
        }

        enter(Stage::Retrieving);
        let retrieval = match self.inner.retriever.retrieve(&question, &request.filter).await {
            Ok(r) => r,
            Err(Error::RetrievalUnavailable(msg)) if self.inner.settings.ungrounded_policy == UngroundedPolicy::Answer => {
                warn!(error = %msg, "retrieval unavailable, answering without context");
                RetrievalResult::empty()
            }
            Err(e) => return Err(e),
        };
        if retrieval.is_empty() && self.inner.settings.ungrounded_policy == UngroundedPolicy::Decline {
            info!("no supporting context, declining");
            return Ok(AskResponse {
                answer_text: DECLINED_ANSWER.to_string(),
                sources: Vec::new(),
                cached: false,
                engine_used: None,
                routing: None,
                confidence: 0.0,
            });
        }

        enter(Stage::Routing);
        let decision = self.route(&request, retrieval.confidence).await;
        info!(
            engine = %decision.engine,
            reason = ?decision.reason,
            confidence = retrieval.confidence,
            "routing decision"
        );

        let model_id = request.hints.model.clone().unwrap_or_else(|| self.backend(decision.engine).model_id().to_string());
        let key = CacheKey::new(&question, &retrieval, decision.engine, &model_id, request.hints.agent.as_deref());

        enter(Stage::CacheCheck);
        let this = self.clone();
        let job = Job { question, retrieval: retrieval.clone(), hints: request.hints, decision, sink: sink.cloned() };
        let (entry, origin) = self.inner.cache.get_or_compute(&key, &retrieval, move || this.generate(job)).await?;

        if origin != Origin::Computed {
            enter(Stage::CacheHit);
            if let Some(sink) = sink {
                let _ = sink.send(StreamEvent::Fragment(entry.answer_text.clone())).await;
            }
        }
        let routing = if entry.mode_used == decision.engine {
            decision
        } else {
            RoutingDecision { engine: entry.mode_used, reason: RoutingReason::CloudUnavailableFallback }
        };
        Ok(AskResponse {
            answer_text: entry.answer_text.clone(),
            sources: retrieval.sources(),
            cached: origin != Origin::Computed,
            engine_used: Some(entry.mode_used),
            routing: Some(routing),
            confidence: retrieval.confidence,
        })
    }

    async fn route(&self, request: &AskRequest, confidence: f32) -> RoutingDecision {
        let settings = &self.inner.settings;
        let use_cloud = request.use_cloud || settings.cloud_by_default;
        let cloud_configured = match &self.inner.cloud {
            Some(cloud) => cloud.is_available().await,
            None => false,
        };
        // the health check only matters when cloud could win
        let local_available = if use_cloud && cloud_configured && request.hints.engine.is_none() {
            self.inner.local.is_available().await
        } else {
            true
        };
        decide_route(&RouteInputs {
            confidence,
            threshold: settings.confidence_threshold,
            use_cloud,
            forced: request.hints.engine,
            cloud_configured,
            local_available,
        })
    }

    fn backend(&self, engine: Engine) -> &Arc<dyn ModelBackend> {
        match (engine, &self.inner.cloud) {
            (Engine::Cloud, Some(cloud)) => cloud,
            _ => &self.inner.local,
        }
    }

    async fn generate(self, job: Job) -> Result<Computed> {
        let sink = job.sink.as_ref();
        let agent = job.hints.agent.as_deref();
        if job.decision.engine == Engine::Local {
            enter(Stage::LocalGenerate);
            let prompt = local_prompt(&job.question, &job.retrieval.hits, agent).with_model(job.hints.model.clone());
            let answer_text = self.stream_answer(&self.inner.local, &prompt, sink, &mut false).await?;
            return Ok(Computed { answer_text, engine: Engine::Local, cacheable: true });
        }

        enter(Stage::CloudGenerate);
        let cloud = self.backend(Engine::Cloud);
        let question = self.inner.sanitizer.sanitize(&job.question);
        let excerpts = self.inner.sanitizer.prepare_cloud_context(&job.retrieval.hits);
        let prompt = cloud_prompt(&question, &excerpts, agent).with_model(job.hints.model.clone());
        let mut started = false;
        match self.stream_answer(cloud, &prompt, sink, &mut started).await {
            Ok(answer_text) => Ok(Computed { answer_text, engine: Engine::Cloud, cacheable: true }),
            Err(e) if e.triggers_fallback() && !started => {
                enter(Stage::Fallback);
                warn!(error = %e, "cloud generation failed, falling back to local");
                enter(Stage::LocalGenerate);
                let prompt = local_prompt(&job.question, &job.retrieval.hits, agent);
                let answer_text = self.stream_answer(&self.inner.local, &prompt, sink, &mut false).await?;
                // not stored under the cloud key so cloud is tried again next time
                Ok(Computed { answer_text, engine: Engine::Local, cacheable: false })
            }
            Err(e) => Err(e),
        }
    }

    /// Drive a backend stream to completion under the engine's total timeout
    /// and the per-fragment idle timeout, forwarding fragments to `sink`.
    async fn stream_answer(
        &self,
        backend: &Arc<dyn ModelBackend>,
        prompt: &Prompt,
        sink: Option<&Sink>,
        started: &mut bool,
    ) -> Result<String> {
        let engine = backend.engine();
        let settings = &self.inner.settings;
        let total = Duration::from_secs(match engine {
            Engine::Local => settings.local_timeout_secs,
            Engine::Cloud => settings.cloud_timeout_secs,
        });
        let idle = Duration::from_secs(settings.idle_timeout_secs);
        let deadline = Instant::now() + total;
        let timed_out = |limit: Duration| Error::ModelTimeout { engine, seconds: limit.as_secs() };

        let mut fragments =
            timeout_at(deadline, backend.generate_stream(prompt)).await.map_err(|_| timed_out(total))??;
        let mut text = String::new();
        loop {
            let idle_deadline = Instant::now() + idle;
            let next = timeout_at(deadline.min(idle_deadline), fragments.next()).await.map_err(|_| {
                if idle_deadline < deadline {
                    timed_out(idle)
                } else {
                    timed_out(total)
                }
            })?;
            let Some(fragment) = next else { break };
            let fragment = fragment?;
            if fragment.is_empty() {
                continue;
            }
            if !*started {
                *started = true;
                enter(Stage::Streaming);
            }
            text.push_str(&fragment);
            if let Some(sink) = sink {
                // a closed sink means the caller left; the select in ask_stream cancels us
                let _ = sink.send(StreamEvent::Fragment(fragment)).await;
            }
        }
        debug!(%engine, chars = text.len(), "generation finished");
        Ok(text)
    }
}

struct Job {
    question: String,
    retrieval: RetrievalResult,
    hints: AskHints,
    decision: RoutingDecision,
    sink: Option<Sink>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> RouteInputs {
        RouteInputs {
            confidence: 0.5,
            threshold: 0.3,
            use_cloud: true,
            forced: None,
            cloud_configured: true,
            local_available: true,
        }
    }

    #[test]
    fn confident_questions_stay_local() {
        let d = decide_route(&inputs());
        assert_eq!(d, RoutingDecision { engine: Engine::Local, reason: RoutingReason::Confidence });
    }

    #[test]
    fn weak_context_goes_to_cloud_when_enabled() {
        let d = decide_route(&RouteInputs { confidence: 0.1, ..inputs() });
        assert_eq!(d, RoutingDecision { engine: Engine::Cloud, reason: RoutingReason::Confidence });
        let d = decide_route(&RouteInputs { local_available: false, ..inputs() });
        assert_eq!(d.engine, Engine::Cloud);
    }

    #[test]
    fn cloud_disabled_or_missing_means_local() {
        let d = decide_route(&RouteInputs { confidence: 0.0, use_cloud: false, ..inputs() });
        assert_eq!(d, RoutingDecision { engine: Engine::Local, reason: RoutingReason::CloudDisabled });
        let d = decide_route(&RouteInputs { confidence: 0.0, cloud_configured: false, ..inputs() });
        assert_eq!(d, RoutingDecision { engine: Engine::Local, reason: RoutingReason::CloudUnavailableFallback });
    }

    #[test]
    fn forced_engine_wins() {
        let d = decide_route(&RouteInputs { forced: Some(Engine::Cloud), use_cloud: false, ..inputs() });
        assert_eq!(d, RoutingDecision { engine: Engine::Cloud, reason: RoutingReason::UserForced });
        let d = decide_route(&RouteInputs { forced: Some(Engine::Local), confidence: 0.0, ..inputs() });
        assert_eq!(d, RoutingDecision { engine: Engine::Local, reason: RoutingReason::UserForced });
        let d = decide_route(&RouteInputs { forced: Some(Engine::Cloud), cloud_configured: false, ..inputs() });
        assert_eq!(d.reason, RoutingReason::CloudUnavailableFallback);
    }
}
