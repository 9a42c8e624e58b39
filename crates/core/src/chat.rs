//! Chat-completion provider client, batch and token-streamed.

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ProviderError;

pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

const TEMPERATURE: f32 = 0.1;

/// One message in provider wire format.
#[derive(Debug, Clone, Serialize)]
pub struct PromptMessage {
    pub role: &'static str,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Capability: generate a reply to a message sequence, whole or as tokens.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, ProviderError>;

    async fn stream(&self, messages: &[PromptMessage]) -> Result<TokenStream, ProviderError>;
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiChatModel {
    client: Client,
    endpoint: String,
    model: String,
}

impl OpenAiChatModel {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let auth = format!("Bearer {}", api_key.trim());
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| ProviderError::Decode("API key is not a valid header value".to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder().default_headers(headers).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
        })
    }

    async fn send(
        &self,
        messages: &[PromptMessage],
        streamed: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let request = ChatRequest {
            model: &self.model,
            temperature: TEMPERATURE,
            stream: streamed,
            messages,
        };
        let response = self.client.post(&self.endpoint).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ProviderError::Status {
                status: status.as_u16(),
                detail,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, ProviderError> {
        let response = self.send(messages, false).await?;
        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Decode("chat response had no choices".to_string()))
    }

    async fn stream(&self, messages: &[PromptMessage]) -> Result<TokenStream, ProviderError> {
        let response = self.send(messages, true).await?;

        let state = SseState {
            bytes: Box::pin(response.bytes_stream()),
            buffer: String::new(),
            pending: VecDeque::new(),
            done: false,
        };

        let tokens = futures_util::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(token) = state.pending.pop_front() {
                    return Some((Ok(token), state));
                }
                if state.done {
                    return None;
                }

                match state.bytes.next().await {
                    None => {
                        state.done = true;
                    }
                    Some(Err(error)) => {
                        state.done = true;
                        return Some((Err(ProviderError::Http(error)), state));
                    }
                    Some(Ok(chunk)) => {
                        state.buffer.push_str(&String::from_utf8_lossy(&chunk));
                        drain_sse_lines(&mut state);
                    }
                }
            }
        });

        Ok(Box::pin(tokens))
    }
}

struct SseState {
    bytes: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buffer: String,
    pending: VecDeque<String>,
    done: bool,
}

/// Consumes complete `data:` lines from the buffer, queuing token deltas.
fn drain_sse_lines(state: &mut SseState) {
    while let Some(newline) = state.buffer.find('\n') {
        let line = state.buffer[..newline].trim().to_string();
        state.buffer.drain(..=newline);

        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            state.done = true;
            return;
        }

        match serde_json::from_str::<ChatStreamChunk>(payload) {
            Ok(parsed) => {
                if let Some(token) = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                {
                    if !token.is_empty() {
                        state.pending.push_back(token);
                    }
                }
            }
            Err(error) => warn!(%error, "skipping unparseable stream line"),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    stream: bool,
    messages: &'a [PromptMessage],
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_lines_yield_tokens_in_order() {
        let mut state = SseState {
            bytes: Box::pin(futures_util::stream::empty()),
            buffer: String::from(
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\
                 data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\
                 data: [DONE]\n",
            ),
            pending: VecDeque::new(),
            done: false,
        };

        drain_sse_lines(&mut state);
        assert_eq!(state.pending, VecDeque::from(["Hel".to_string(), "lo".to_string()]));
        assert!(state.done);
    }

    #[test]
    fn partial_lines_wait_for_more_bytes() {
        let mut state = SseState {
            bytes: Box::pin(futures_util::stream::empty()),
            buffer: String::from("data: {\"choices\":[{\"delta\":{\"content\":\"par"),
            pending: VecDeque::new(),
            done: false,
        };

        drain_sse_lines(&mut state);
        assert!(state.pending.is_empty());
        assert!(!state.done);
        assert!(state.buffer.starts_with("data:"));
    }

    #[test]
    fn empty_deltas_are_skipped() {
        let mut state = SseState {
            bytes: Box::pin(futures_util::stream::empty()),
            buffer: String::from("data: {\"choices\":[{\"delta\":{}}]}\n"),
            pending: VecDeque::new(),
            done: false,
        };

        drain_sse_lines(&mut state);
        assert!(state.pending.is_empty());
    }
}
