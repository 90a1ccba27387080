//! Async adapter over a synchronous [`Embedder`].
//!
//! Every call runs on the blocking pool under a timeout. Transient failures
//! are retried with bounded exponential backoff; a wrong vector width is
//! reported at once as [`Error::DimensionMismatch`].

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use docqa_core::config::EmbeddingSettings;
use docqa_core::traits::Embedder;
use docqa_core::{Error, Result};

const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct EmbeddingProvider {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl EmbeddingProvider {
    pub fn new(embedder: Arc<dyn Embedder>, settings: &EmbeddingSettings) -> Self {
        Self {
            embedder,
            batch_size: settings.batch_size.max(1),
            timeout: settings.timeout(),
            max_retries: settings.max_retries,
            backoff: settings.backoff(),
        }
    }

    pub fn dim(&self) -> usize {
        self.embedder.dim()
    }

    pub fn model_id(&self) -> &str {
        self.embedder.id()
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop().ok_or_else(|| Error::EmbeddingFailure { attempts: 1, message: "empty embedding result".into() })
    }

    /// Embed `texts` in batches of `batch_size`, preserving order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_with_retry(batch).await?);
        }
        Ok(out)
    }

    async fn embed_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let message = match self.embed_once(batch).await {
                Ok(vectors) => return self.check(batch.len(), vectors),
                Err(message) => message,
            };
            if attempt > self.max_retries {
                return Err(Error::EmbeddingFailure { attempts: attempt, message });
            }
            let delay = self.delay(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %message, "embedding failed, retrying");
            sleep(delay).await;
        }
    }

    async fn embed_once(&self, batch: &[String]) -> std::result::Result<Vec<Vec<f32>>, String> {
        let embedder = Arc::clone(&self.embedder);
        let owned = batch.to_vec();
        let task = tokio::task::spawn_blocking(move || embedder.embed_batch(&owned));
        match timeout(self.timeout, task).await {
            Err(_) => Err(format!("timed out after {:?}", self.timeout)),
            Ok(Err(join)) => Err(format!("embedding task failed: {join}")),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Ok(Ok(vectors))) => Ok(vectors),
        }
    }

    fn check(&self, expected_rows: usize, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        if vectors.len() != expected_rows {
            return Err(Error::EmbeddingFailure {
                attempts: 1,
                message: format!("expected {expected_rows} vectors, got {}", vectors.len()),
            });
        }
        let dim = self.dim();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
            return Err(Error::DimensionMismatch { expected: dim, actual: bad.len() });
        }
        debug!(rows = expected_rows, dim, "embedded batch");
        Ok(vectors)
    }

    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}
