//! Completion provider seam and the OpenAI adapter

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client as OpenAIClient;
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use std::borrow::Cow;
use std::pin::Pin;
use thiserror::Error;
use tracing::debug;

use super::types::{ConversationTurn, Role};

/// Model used when none is configured
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// One streamed chat completion request.
///
/// History turns are borrowed from the caller; only the system instruction
/// and the current issue are owned.
#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub messages: Vec<Cow<'a, ConversationTurn>>,
    pub temperature: f32,
    pub top_p: f32,
}

/// A single streamed increment
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompletionChunk {
    /// Text of the first choice; `None` for chunks without choices
    pub delta: Option<String>,
}

impl CompletionChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
        }
    }

    pub fn empty() -> Self {
        Self { delta: None }
    }
}

/// Provider-side failures, classified for retry decisions
#[derive(Debug, Clone, Error)]
pub enum ProviderFailure {
    /// Unreachable, timed out or overloaded; worth one retry
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// Request refused (bad key, invalid arguments)
    #[error("Provider rejected request: {0}")]
    Rejected(String),

    /// Stream broke after it was opened
    #[error("Stream interrupted: {0}")]
    Interrupted(String),
}

pub type CompletionStream =
    Pin<Box<dyn Stream<Item = Result<CompletionChunk, ProviderFailure>> + Send>>;

/// A chat model that can stream completions
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    /// Open a completion stream. Failing here means no content was produced.
    async fn open_stream(
        &self,
        request: &CompletionRequest<'_>,
    ) -> Result<CompletionStream, ProviderFailure>;
}

/// Chat completions over the OpenAI API (or a compatible endpoint)
pub struct OpenAiProvider {
    client: OpenAIClient<OpenAIConfig>,
    model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: &str, model: impl Into<String>, api_base: Option<&str>) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base) = api_base {
            config = config.with_api_base(base);
        }

        Self {
            client: OpenAIClient::with_config(config),
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn to_openai_message(turn: &ConversationTurn) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    let content = turn.content.clone();
    Ok(match turn.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()?
            .into(),
    })
}

/// Classify a failure that happened before any content arrived
fn classify_open_error(err: OpenAIError) -> ProviderFailure {
    match err {
        OpenAIError::Reqwest(e) => {
            if e.is_connect() || e.is_timeout() {
                ProviderFailure::Unavailable(e.to_string())
            } else if e.status().map_or(false, |s| s.is_client_error() && s.as_u16() != 429) {
                ProviderFailure::Rejected(e.to_string())
            } else {
                ProviderFailure::Unavailable(e.to_string())
            }
        }
        OpenAIError::ApiError(e) => ProviderFailure::Rejected(e.message),
        OpenAIError::InvalidArgument(msg) => ProviderFailure::Rejected(msg),
        // Event-source failures only carry text; 4xx other than 429 is a refusal
        OpenAIError::StreamError(msg) => {
            if msg.contains("status code: 4") && !msg.contains("429") {
                ProviderFailure::Rejected(msg)
            } else {
                ProviderFailure::Unavailable(msg)
            }
        }
        other => ProviderFailure::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn open_stream(
        &self,
        request: &CompletionRequest<'_>,
    ) -> Result<CompletionStream, ProviderFailure> {
        let messages = request
            .messages
            .iter()
            .map(|turn| to_openai_message(turn))
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify_open_error)?;

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(request.temperature)
            .top_p(request.top_p)
            .stream(true)
            .build()
            .map_err(classify_open_error)?;

        debug!(model = %self.model, messages = request.messages.len(), "Opening chat completion stream");

        let mut upstream = self
            .client
            .chat()
            .create_stream(chat_request)
            .await
            .map_err(classify_open_error)?;

        // The HTTP exchange is lazy; pull the first event so connection and
        // status failures surface as open errors rather than mid-stream ones.
        let first = match upstream.next().await {
            Some(Ok(response)) => response,
            Some(Err(e)) => return Err(classify_open_error(e)),
            None => return Ok(Box::pin(stream::empty())),
        };

        let chunks = stream::once(async move { Ok(first) })
            .chain(upstream)
            .map(|item| match item {
                Ok(response) => Ok(CompletionChunk {
                    delta: response
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.delta.content),
                }),
                Err(e) => Err(ProviderFailure::Interrupted(e.to_string())),
            });

        Ok(Box::pin(chunks))
    }
}
