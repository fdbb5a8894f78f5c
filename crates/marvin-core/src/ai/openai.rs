use std::time::Duration;

use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

use super::cancel::CancellationHandle;
use super::stream::{fragments_from_sse, with_cancellation, ChatStream};
use crate::config::Config;
use crate::error::ChatError;
use crate::state::{ChatMessage, ChatRole};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4-1106-preview";

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Deserialize)]
struct OpenAIResponseMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
}

/// What to do when the first choice is not an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnexpectedRolePolicy {
    /// Answer with an empty string.
    #[default]
    EmptyAnswer,
    /// Fail with [`ChatError::UnexpectedRole`].
    Error,
}

impl UnexpectedRolePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnexpectedRolePolicy::EmptyAnswer => "empty_answer",
            UnexpectedRolePolicy::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "empty_answer" | "empty" => Some(UnexpectedRolePolicy::EmptyAnswer),
            "error" | "strict" => Some(UnexpectedRolePolicy::Error),
            _ => None,
        }
    }

    pub fn all() -> Vec<UnexpectedRolePolicy> {
        vec![UnexpectedRolePolicy::EmptyAnswer, UnexpectedRolePolicy::Error]
    }
}

/// Client for an OpenAI-style chat completions endpoint.
#[derive(Clone)]
pub struct ChatClient {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
    unexpected_role: UnexpectedRolePolicy,
    timeout: Option<Duration>,
}

impl ChatClient {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            unexpected_role: UnexpectedRolePolicy::default(),
            timeout: None,
        }
    }

    /// Build a client from stored settings. No timeout unless one is configured.
    pub fn from_config(config: &Config, api_key: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            endpoint: config.endpoint.clone(),
            unexpected_role: config.unexpected_role,
            timeout: config.request_timeout(),
        }
    }

    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = url.into();
        self
    }

    pub fn with_unexpected_role(mut self, policy: UnexpectedRolePolicy) -> Self {
        self.unexpected_role = policy;
        self
    }

    /// Limit for a whole non-streaming request. Streamed answers are never
    /// cut off by it; cancel them through their handle instead.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send `messages` and wait for the whole answer.
    ///
    /// Resolves with [`ChatError::Cancelled`] if `handle` is cancelled first.
    pub async fn complete(&self, messages: &[ChatMessage], handle: &CancellationHandle) -> Result<String, ChatError> {
        let result = tokio::select! {
            biased;
            _ = handle.token().cancelled() => Err(ChatError::Cancelled),
            result = self.request_answer(messages) => result,
        };

        if let Err(err) = &result {
            self.log_failure(handle, err);
        }
        result
    }

    /// Send `messages` with streaming enabled and return the answer fragments.
    ///
    /// Cancelling `handle` while the stream is consumed ends it with
    /// [`ChatError::Cancelled`].
    pub async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
        handle: &CancellationHandle,
    ) -> Result<ChatStream, ChatError> {
        let response = tokio::select! {
            biased;
            _ = handle.token().cancelled() => Err(ChatError::Cancelled),
            response = self.send(messages, true) => response,
        };

        match response {
            Ok(response) => Ok(with_cancellation(
                fragments_from_sse(response),
                handle.token().clone(),
            )),
            Err(err) => {
                self.log_failure(handle, &err);
                Err(err)
            }
        }
    }

    async fn request_answer(&self, messages: &[ChatMessage]) -> Result<String, ChatError> {
        let response = self.send(messages, false).await?;
        let openai_response: OpenAIResponse = response.json().await?;
        self.extract_answer(openai_response)
    }

    async fn send(&self, messages: &[ChatMessage], stream: bool) -> Result<Response, ChatError> {
        let request = OpenAIRequest {
            model: &self.model,
            messages,
            stream,
        };

        let mut builder = self.client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(timeout) = self.timeout.filter(|_| !stream) {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Api { status, body });
        }

        Ok(response)
    }

    fn extract_answer(&self, response: OpenAIResponse) -> Result<String, ChatError> {
        let message = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| ChatError::MalformedResponse("response contained no choices".to_string()))?;

        if message.role == ChatRole::Assistant.as_str() {
            return Ok(message.content.unwrap_or_default());
        }

        match self.unexpected_role {
            UnexpectedRolePolicy::EmptyAnswer => {
                log::warn!("Reply role was '{}', not assistant; answering with empty text", message.role);
                Ok(String::new())
            }
            UnexpectedRolePolicy::Error => Err(ChatError::UnexpectedRole(message.role)),
        }
    }

    fn log_failure(&self, handle: &CancellationHandle, err: &ChatError) {
        if err.is_cancelled() {
            log::info!("Chat request {} cancelled", handle.id());
        } else {
            log::error!("Error calling chat completions API: {}", err);
        }
    }
}
