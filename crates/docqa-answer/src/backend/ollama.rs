//! Local generation through the Ollama HTTP API.
//!
//! - `POST /api/generate` with `stream: true`, one JSON object per line
//! - `GET /api/version` as health check

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use docqa_core::config::LocalModelSettings;
use docqa_core::types::Engine;
use docqa_core::{Error, Result};

use super::{frames, FragmentStream, Frame, ModelBackend};
use crate::prompt::Prompt;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(settings: &LocalModelSettings) -> Result<Self> {
        // No overall request timeout: the router bounds generation itself.
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

fn parse_line(line: &str) -> Result<Frame> {
    let parsed: GenerateLine = serde_json::from_str(line)
        .map_err(|e| Error::unavailable(Engine::Local, format!("malformed stream line: {e}")))?;
    if let Some(message) = parsed.error {
        return Err(Error::unavailable(Engine::Local, message));
    }
    match (parsed.done, parsed.response.is_empty()) {
        (true, true) => Ok(Frame::End),
        (_, true) => Ok(Frame::Skip),
        (_, false) => Ok(Frame::Text(parsed.response)),
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn engine(&self) -> Engine {
        Engine::Local
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/version", self.base_url);
        match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "local model health check failed");
                false
            }
        }
    }

    async fn generate_stream(&self, prompt: &Prompt) -> Result<FragmentStream> {
        let url = format!("{}/api/generate", self.base_url);
        let model = prompt.model().unwrap_or(self.model.as_str());
        let request = GenerateRequest { model, prompt: prompt.user(), system: prompt.system(), stream: true };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::unavailable(Engine::Local, format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::unavailable(Engine::Local, format!("HTTP {status}: {body}")));
        }
        debug!(model, "local generation started");
        Ok(frames(response.bytes_stream(), Engine::Local, parse_line))
    }
}
