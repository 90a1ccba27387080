//! Model backends. Local and cloud engines share one capability surface so
//! the router never needs to know which one it is talking to.

pub mod cloud;
pub mod ollama;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;

use docqa_core::types::Engine;
use docqa_core::{Error, Result};

use crate::prompt::Prompt;

pub use cloud::CloudBackend;
pub use ollama::OllamaBackend;

/// Lazy, finite sequence of answer fragments. Dropping it cancels generation.
pub type FragmentStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn engine(&self) -> Engine;

    /// Default model; a prompt may name a different one.
    fn model_id(&self) -> &str;

    async fn is_available(&self) -> bool;

    async fn generate_stream(&self, prompt: &Prompt) -> Result<FragmentStream>;

    /// Whole answer at once.
    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let mut fragments = self.generate_stream(prompt).await?;
        let mut text = String::new();
        while let Some(fragment) = fragments.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

/// One decoded line of a streaming HTTP body.
pub(crate) enum Frame {
    Text(String),
    Skip,
    End,
}

struct FrameState<S> {
    body: Pin<Box<S>>,
    buf: Vec<u8>,
    body_done: bool,
    finished: bool,
}

/// Split a byte stream into newline-delimited frames and decode each with
/// `parse`. A transport error or a failed parse terminates the stream with
/// that error.
pub(crate) fn frames<S, B, E>(body: S, engine: Engine, parse: fn(&str) -> Result<Frame>) -> FragmentStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = FrameState { body: Box::pin(body), buf: Vec::new(), body_done: false, finished: false };
    stream::unfold(state, move |mut st| async move {
        loop {
            if st.finished {
                return None;
            }
            if let Some(pos) = st.buf.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = st.buf.drain(..=pos).collect();
                let decoded = match std::str::from_utf8(&raw) {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => parse(line.trim()),
                    Err(e) => Err(Error::unavailable(engine, format!("invalid utf-8 in stream: {e}"))),
                };
                match decoded {
                    Ok(Frame::Text(text)) => return Some((Ok(text), st)),
                    Ok(Frame::Skip) => continue,
                    Ok(Frame::End) => {
                        st.finished = true;
                        return None;
                    }
                    Err(e) => {
                        st.finished = true;
                        return Some((Err(e), st));
                    }
                }
            }
            if st.body_done {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => st.buf.extend_from_slice(bytes.as_ref()),
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(Error::unavailable(engine, format!("stream interrupted: {e}"))), st));
                }
                None => {
                    st.body_done = true;
                    if !st.buf.is_empty() {
                        st.buf.push(b'\n');
                    }
                }
            }
        }
    })
    .boxed()
}
