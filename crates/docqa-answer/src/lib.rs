//! Answering layer: sanitizer, prompt building, model backends, the answer
//! cache and the router that ties them to retrieval.

pub mod backend;
pub mod cache;
pub mod prompt;
pub mod router;
pub mod sanitize;

pub use backend::{CloudBackend, FragmentStream, ModelBackend, OllamaBackend};
pub use cache::{AnswerCache, CacheEntry, CacheKey, Computed, Origin};
pub use prompt::{Persona, Prompt};
pub use router::{decide_route, Orchestrator, RouteInputs, Stage, StreamEvent, DECLINED_ANSWER};
pub use sanitize::{CloudExcerpt, SanitizedText, Sanitizer};
