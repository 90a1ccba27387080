//! Cloud generation through an OpenAI-compatible chat-completions endpoint,
//! streamed as server-sent events.
//!
//! Every call is gated: the prompt must have been built from sanitized text
//! and must still pass [`Sanitizer::verify`], otherwise the request is refused
//! before anything leaves the machine.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use docqa_core::config::CloudModelSettings;
use docqa_core::types::Engine;
use docqa_core::{Error, Result};

use super::{frames, FragmentStream, Frame, ModelBackend};
use crate::prompt::Prompt;
use crate::sanitize::Sanitizer;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct CloudBackend {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    sanitizer: Arc<Sanitizer>,
}

impl CloudBackend {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: impl Into<String>,
        sanitizer: Arc<Sanitizer>,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.into(),
            sanitizer,
        })
    }

    /// `None` when the key variable named by `api_key_env` is unset or
    /// empty; cloud routing then treats the engine as unconfigured.
    pub fn from_settings(settings: &CloudModelSettings, sanitizer: Arc<Sanitizer>) -> Result<Option<Self>> {
        match std::env::var(&settings.api_key_env) {
            Ok(key) if !key.trim().is_empty() => {
                Self::new(&settings.base_url, &settings.model, key.trim(), sanitizer).map(Some)
            }
            _ => {
                debug!(var = %settings.api_key_env, "no cloud API key, cloud engine disabled");
                Ok(None)
            }
        }
    }

    fn ensure_sanitized(&self, prompt: &Prompt) -> Result<()> {
        if !prompt.is_sanitized() {
            error!("cloud call with a prompt not built from sanitized text");
            return Err(Error::SanitizationBypassAttempt("prompt was not built from sanitized text".into()));
        }
        for part in [prompt.system(), prompt.user()] {
            if !self.sanitizer.verify(part) {
                let classes = self.sanitizer.detected(part).join(", ");
                error!(classes = %classes, "cloud payload failed verification");
                return Err(Error::SanitizationBypassAttempt(format!("payload still contains: {classes}")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    delta: ChatDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChatDelta {
    content: Option<String>,
}

fn parse_event(line: &str) -> Result<Frame> {
    // comments, `event:` and `id:` lines carry no text
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(Frame::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(Frame::End);
    }
    let chunk: ChatChunk = serde_json::from_str(data)
        .map_err(|e| Error::unavailable(Engine::Cloud, format!("malformed event: {e}")))?;
    let text: String = chunk.choices.into_iter().filter_map(|c| c.delta.content).collect();
    if text.is_empty() {
        Ok(Frame::Skip)
    } else {
        Ok(Frame::Text(text))
    }
}

#[async_trait]
impl ModelBackend for CloudBackend {
    fn engine(&self) -> Engine {
        Engine::Cloud
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn generate_stream(&self, prompt: &Prompt) -> Result<FragmentStream> {
        self.ensure_sanitized(prompt)?;

        let url = format!("{}/chat/completions", self.base_url);
        let model = prompt.model().unwrap_or(self.model.as_str());
        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage { role: "system", content: prompt.system() },
                ChatMessage { role: "user", content: prompt.user() },
            ],
            stream: true,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::unavailable(Engine::Cloud, format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::unavailable(Engine::Cloud, format!("HTTP {status}: {body}")));
        }
        debug!(model, "cloud generation started");
        Ok(frames(response.bytes_stream(), Engine::Cloud, parse_event))
    }
}
