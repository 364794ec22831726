use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::{ChatMessage, Role};

pub const DEFAULT_LLM_API_URL: &str = "https://api.together.xyz/v1";
pub const DEFAULT_MODEL: &str = "meta-llama/Meta-Llama-3-70B-Instruct";
pub const DEFAULT_LANGUAGE: &str = "en";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Sampling parameters for a completion request.
#[derive(Clone, Debug)]
pub struct ChatOptions {
    /// Overrides the provider's configured model when set.
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.7,
            max_tokens: 1024,
            top_p: 0.9,
        }
    }
}

// Alias for the stream of content deltas returned by `stream_chat`.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Interface to a chat-completion backend.
///
/// Both operations are single in-flight exchanges: no internal queuing,
/// retrying or deduplication. Concurrent calls get independent requests.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Sends the conversation and returns the complete assistant reply.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        language: &str,
        options: &ChatOptions,
    ) -> Result<String>;

    /// Sends the conversation with streaming enabled and returns the
    /// stream of non-empty content deltas, in arrival order.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        language: &str,
        options: &ChatOptions,
    ) -> Result<DeltaStream>;
}

// --- Wire shapes (OpenAI-compatible chat completions) ---

#[derive(Serialize, Debug)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ApiChatMessage>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    stream: bool,
}

#[derive(Serialize, Debug)]
struct ApiChatMessage {
    role: Role,
    content: String,
}

#[derive(Deserialize, Debug)]
struct ChatCompletionResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize, Debug)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

// Response structure for streaming chunks. Only the delta matters; frames
// missing it (role-only first chunk, keep-alives) simply carry no content.
#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorBody {
    error: Option<ApiErrorDetail>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorDetail {
    message: Option<String>,
}

/// Chat provider for any OpenAI-compatible chat-completions endpoint
/// (Together, Groq, OpenAI, vLLM, ...).
pub struct OpenAICompatibleProvider {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl OpenAICompatibleProvider {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        // Connect timeout only: a total request timeout would cut off
        // long-running streamed generations.
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_url.trim_end_matches('/'))
    }

    fn build_request(
        &self,
        messages: &[ChatMessage],
        language: &str,
        options: &ChatOptions,
        stream: bool,
    ) -> ChatCompletionRequest {
        let mut api_messages = Vec::with_capacity(messages.len() + 1);
        api_messages.push(ApiChatMessage {
            role: Role::System,
            content: system_prompt(language),
        });
        api_messages.extend(messages.iter().map(|msg| ApiChatMessage {
            role: msg.role,
            content: msg.content.clone(),
        }));

        ChatCompletionRequest {
            model: options.model.clone().unwrap_or_else(|| self.model.clone()),
            messages: api_messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            stream,
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAICompatibleProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        language: &str,
        options: &ChatOptions,
    ) -> Result<String> {
        let request = self.build_request(messages, language, options, false);
        log::info!(
            "Sending completion request to {} using model: {}",
            self.api_url,
            request.model
        );

        let response = self
            .client
            .post(self.chat_completions_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let completion: ChatCompletionResponse = response.json().await?;

        if let Some(usage) = &completion.usage {
            log::debug!(
                "Token usage: {} prompt, {} completion",
                usage.prompt_tokens,
                usage.completion_tokens
            );
        }

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| Error::Api("Response contained no completion".to_string()))
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        language: &str,
        options: &ChatOptions,
    ) -> Result<DeltaStream> {
        let request = self.build_request(messages, language, options, true);
        log::info!(
            "Sending stream request to {} using model: {}",
            self.api_url,
            request.model
        );

        let response = self
            .client
            .post(self.chat_completions_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        // Process the SSE stream: each frame either carries a content
        // delta, is the [DONE] sentinel, or is skipped.
        let event_stream = response.bytes_stream().eventsource();

        let delta_stream = event_stream
            .map(|event_result| -> Result<Option<String>> {
                let event = event_result.map_err(|e| Error::Stream(e.to_string()))?;
                let data = event.data.trim();

                if data == "[DONE]" {
                    log::debug!("Stream finished with [DONE]");
                    return Ok(None);
                }

                match serde_json::from_str::<StreamChunk>(data) {
                    Ok(chunk) => Ok(chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.delta.content)
                        .filter(|content| !content.is_empty())),
                    Err(e) => {
                        // One malformed frame must not abort an otherwise
                        // good stream.
                        log::warn!("Skipping malformed stream frame: {} - Data: {}", e, data);
                        Ok(None)
                    }
                }
            })
            .filter_map(|result| async move {
                match result {
                    Ok(Some(content)) => Some(Ok(content)),
                    Ok(None) => None,
                    Err(e) => {
                        log::error!("Error reading stream: {}", e);
                        Some(Err(e))
                    }
                }
            });

        Ok(Box::pin(delta_stream))
    }
}

// Extracts a structured error message from a non-2xx response body, or
// falls back to a generic status-tagged message.
async fn error_from_response(response: reqwest::Response) -> Error {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<Failed to read error body>".to_string());
    log::error!("Chat API request failed with status {}: {}", status, body);

    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .ok()
        .and_then(|parsed| parsed.error)
        .and_then(|detail| detail.message);

    match message {
        Some(message) => Error::Api(message),
        None => Error::Api(format!("API request failed with status {}", status)),
    }
}

/// System prompt encoding the assistant persona, plus an explicit
/// instruction to answer in the user's language when it isn't English.
pub fn system_prompt(language: &str) -> String {
    let base = "You are a knowledgeable and compassionate Bible study assistant. Your role is to:
- Help users understand Biblical texts and their meanings
- Provide historical and cultural context
- Answer theological questions with wisdom and respect
- Offer spiritual guidance based on Biblical principles
- Be respectful of different Christian denominations and interpretations
- Cite specific Bible verses when relevant
- Respond in a warm, encouraging, and non-judgmental manner

Always maintain accuracy in Biblical references and be clear when offering interpretations versus established doctrine.";

    if language == DEFAULT_LANGUAGE {
        base.to_string()
    } else {
        format!(
            "{}\n\nIMPORTANT: Respond in {} language.",
            base,
            language_name(language)
        )
    }
}

fn language_name(code: &str) -> &'static str {
    match code {
        "en" => "English",
        "es" => "Spanish",
        "fr" => "French",
        "de" => "German",
        "it" => "Italian",
        "pt" => "Portuguese",
        "zh" => "Chinese",
        "ja" => "Japanese",
        "ko" => "Korean",
        "ar" => "Arabic",
        "hi" => "Hindi",
        "ru" => "Russian",
        _ => "English",
    }
}
