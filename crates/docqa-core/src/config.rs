//! Lightweight configuration loader and path helpers.
//!
//! Uses Figment to merge built-in defaults + `config.toml` + `config.<env>.toml`
//! + `APP_*` env vars (nested keys separated by `__`, e.g.
//! `APP_ROUTING__CONFIDENCE_THRESHOLD`). Provides helpers to expand `~` and
//! `${VAR}` and to resolve relative paths against a known base directory.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Error;

pub struct Config {
    figment: Figment,
}

impl Config {
    /// Load from the current working directory.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Merge defaults, `config.toml`, `config.<env>.toml` and `APP_*` variables,
    /// with files resolved against `dir`.
    pub fn load_from(dir: &Path) -> anyhow::Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        debug!(env = %env_name, dir = %dir.display(), "loading configuration");
        let config = Self { figment: layered(dir, &env_name) };
        config.validate_for_env(&env_name)?;
        Ok(config)
    }

    pub fn from_figment(figment: Figment) -> Self {
        Self { figment }
    }

    pub fn get<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| anyhow::anyhow!("Failed to get '{}': {}", key, e))
    }

    /// Typed view over the merged configuration.
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let settings: Settings = self
            .figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to parse settings: {}", e))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate_for_env(&self, env: &str) -> anyhow::Result<()> {
        if matches!(env, "prod" | "production") {
            // Production runs must not silently swap in the hash embedder.
            let fake: bool = self.get("embedding.use_fake").unwrap_or(false);
            if fake {
                anyhow::bail!("embedding.use_fake is not allowed in production");
            }
        }
        Ok(())
    }
}

fn layered(dir: &Path, env_name: &str) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(Settings::default()))
        .merge(Toml::file(dir.join("config.toml")));
    match env_name {
        "dev" | "development" => figment = figment.merge(Toml::file(dir.join("config.dev.toml"))),
        "prod" | "production" => figment = figment.merge(Toml::file(dir.join("config.prod.toml"))),
        "test" | "testing" => figment = figment.merge(Toml::file(dir.join("config.test.toml"))),
        other => warn!(env = other, "unknown RUST_ENV, using config.toml only"),
    }
    figment.merge(Env::prefixed("APP_").split("__"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub chunking: ChunkingSettings,
    pub embedding: EmbeddingSettings,
    pub retrieval: RetrievalSettings,
    pub routing: RoutingSettings,
    pub sanitizer: SanitizerSettings,
    pub cache: CacheSettings,
    pub storage: StorageSettings,
    pub local_model: LocalModelSettings,
    pub cloud_model: CloudModelSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        if self.chunking.max_chars == 0 {
            return invalid("chunking.max_chars must be positive".into());
        }
        if !(0.0..1.0).contains(&self.chunking.overlap_percent) {
            return invalid(format!(
                "chunking.overlap_percent must be in [0, 1), got {}",
                self.chunking.overlap_percent
            ));
        }
        if self.embedding.dim == 0 || self.embedding.batch_size == 0 {
            return invalid("embedding.dim and embedding.batch_size must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.retrieval.alpha) {
            return invalid(format!("retrieval.alpha must be in [0, 1], got {}", self.retrieval.alpha));
        }
        if self.retrieval.top_k == 0 || self.retrieval.candidates < self.retrieval.top_k {
            return invalid(format!(
                "retrieval.candidates ({}) must be >= retrieval.top_k ({}) > 0",
                self.retrieval.candidates, self.retrieval.top_k
            ));
        }
        if !(0.0..=1.0).contains(&self.routing.confidence_threshold) {
            return invalid(format!(
                "routing.confidence_threshold must be in [0, 1], got {}",
                self.routing.confidence_threshold
            ));
        }
        if self.cache.max_entries == 0 {
            return invalid("cache.max_entries must be positive".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    /// Character budget per chunk.
    pub max_chars: usize,
    /// Share of `max_chars` carried over from the previous chunk.
    pub overlap_percent: f32,
    /// Chunks shorter than this (after cleaning) are skipped.
    pub min_chars: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self { max_chars: 800, overlap_percent: 0.15, min_chars: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub dim: usize,
    pub batch_size: usize,
    pub max_len: usize,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub model_dir: Option<String>,
    pub use_fake: bool,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            dim: 1024,
            batch_size: 32,
            max_len: 256,
            timeout_ms: 30_000,
            max_retries: 3,
            backoff_ms: 200,
            model_dir: None,
            use_fake: false,
        }
    }
}

impl EmbeddingSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceMethod {
    /// Top score minus the k-th score.
    Gap,
    /// Top score minus the mean of the remaining scores.
    MeanGap,
    /// Top score alone.
    Top,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Vector candidates fetched before reranking (N).
    pub candidates: usize,
    /// Final context size (k).
    pub top_k: usize,
    /// Weight of the vector score in the hybrid score.
    pub alpha: f32,
    /// Same-document chunks whose byte spans overlap, touch or lie at most
    /// this many bytes apart are near-duplicates; only the best one is kept.
    pub dedup_window: usize,
    pub confidence: ConfidenceMethod,
    pub enable_lexical: bool,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            candidates: 20,
            top_k: 5,
            alpha: 0.7,
            dedup_window: 0,
            confidence: ConfidenceMethod::Gap,
            enable_lexical: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UngroundedPolicy {
    /// Reply with a fixed "nothing found" answer and no model call.
    Decline,
    /// Ask the model anyway, telling it no context was found.
    Answer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    pub confidence_threshold: f32,
    pub cloud_by_default: bool,
    pub ungrounded_policy: UngroundedPolicy,
    pub local_timeout_secs: u64,
    pub cloud_timeout_secs: u64,
    /// Longest pause tolerated between two streamed fragments.
    pub idle_timeout_secs: u64,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.15,
            cloud_by_default: false,
            ungrounded_policy: UngroundedPolicy::Decline,
            local_timeout_secs: 240,
            cloud_timeout_secs: 60,
            idle_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSettings {
    pub name: String,
    pub regex: String,
    pub placeholder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizerSettings {
    pub max_chunks_cloud: usize,
    pub max_chunk_chars_cloud: usize,
    pub extra_patterns: Vec<PatternSettings>,
}

impl Default for SanitizerSettings {
    fn default() -> Self {
        Self { max_chunks_cloud: 2, max_chunk_chars_cloud: 1500, extra_patterns: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub dir: Option<String>,
    pub ttl_secs: Option<u64>,
    /// Upper bound on answers held in memory; least useful ones go first.
    pub max_entries: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { dir: None, ttl_secs: None, max_entries: 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub index_dir: String,
    pub text_index_dir: String,
    pub table: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            index_dir: "~/.docqa/lancedb".to_string(),
            text_index_dir: "~/.docqa/tantivy".to_string(),
            table: "chunks".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalModelSettings {
    pub base_url: String,
    pub model: String,
}

impl Default for LocalModelSettings {
    fn default() -> Self {
        Self { base_url: "http://127.0.0.1:11434".to_string(), model: "mistral".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudModelSettings {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for CloudModelSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "DOCQA_CLOUD_API_KEY".to_string(),
        }
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
/// If `p` is absolute, it's returned as-is; otherwise `base.join(p)` is returned.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
