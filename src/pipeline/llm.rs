//! Model-service boundary: one request in, one response or classified error out.
//!
//! Stages talk to [`ModelService`] only. The production implementation,
//! [`LlmModelService`], adapts an `edgequake_llm` provider; tests substitute a
//! scripted mock. Retry and backoff live in [`crate::retry`], not here, so
//! every call site gets the same bounded, logged loop.
//!
//! ## Message Layout
//!
//! 1. **System message**: the stage instructions
//! 2. **Context message** *(translation with a context window only)*: prior
//!    source text, sent separately so the model never confuses it with the
//!    content to translate
//! 3. **User message**: the content, plus page images when present

use crate::error::UnitError;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, LlmError};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Language pair attached to translation requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageHints {
    pub source: String,
    pub target: String,
}

/// One call to the model service.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// Short label for logs, e.g. `generate/chapter_3`.
    pub label: String,
    pub instructions: String,
    pub content: String,
    /// Trailing prior source text; never longer than the configured limit.
    pub context: Option<String>,
    pub images: Vec<ImageData>,
    pub language: Option<LanguageHints>,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl ModelRequest {
    pub fn new(label: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            instructions: instructions.into(),
            content: String::new(),
            context: None,
            images: Vec::new(),
            language: None,
            temperature: 0.1,
            max_tokens: 16384,
        }
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn context(mut self, context: Option<String>) -> Self {
        self.context = context.filter(|c| !c.is_empty());
        self
    }

    pub fn images(mut self, images: Vec<ImageData>) -> Self {
        self.images = images;
        self
    }

    pub fn language(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.language = Some(LanguageHints {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    pub fn sampling(mut self, temperature: f32, max_tokens: usize) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Approximate payload size: text plus base64 image data.
    pub fn payload_bytes(&self) -> usize {
        self.instructions.len()
            + self.content.len()
            + self.context.as_ref().map_or(0, String::len)
            + self.images.iter().map(|i| i.data.len()).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResponse {
    pub content: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

#[async_trait]
pub trait ModelService: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, UnitError>;
}

/// [`ModelService`] backed by an `edgequake_llm` provider.
pub struct LlmModelService {
    provider: Arc<dyn LLMProvider>,
}

impl LlmModelService {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ModelService for LlmModelService {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, UnitError> {
        let start = Instant::now();
        let messages = build_messages(request);
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| classify_provider_error(&e))?;

        debug!(
            "{}: {} input tokens, {} output tokens, {:?}",
            request.label,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        Ok(ModelResponse {
            content: response.content,
            input_tokens: response.prompt_tokens as usize,
            output_tokens: response.completion_tokens as usize,
        })
    }
}

fn build_messages(request: &ModelRequest) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(request.instructions.as_str())];
    if let Some(context) = &request.context {
        messages.push(ChatMessage::system(crate::prompts::context_block(context)));
    }
    if request.images.is_empty() {
        messages.push(ChatMessage::user(request.content.as_str()));
    } else {
        messages.push(ChatMessage::user_with_images(
            request.content.as_str(),
            request.images.clone(),
        ));
    }
    messages
}

/// Map a provider error to the unit error taxonomy.
///
/// Typed variants decide directly. `ApiError`, `ProviderError` and `Unknown`
/// only carry the provider's message, so those fall through to
/// [`classify_provider_message`].
pub fn classify_provider_error(error: &LlmError) -> UnitError {
    let message = error.to_string();
    match error {
        LlmError::RateLimited(_) => UnitError::RateLimited(message),
        LlmError::NetworkError(_) | LlmError::Timeout => UnitError::Transient(message),
        LlmError::AuthError(_)
        | LlmError::InvalidRequest(_)
        | LlmError::TokenLimitExceeded { .. }
        | LlmError::ModelNotFound(_)
        | LlmError::ConfigError(_)
        | LlmError::NotSupported(_) => UnitError::Fatal(message),
        LlmError::SerializationError(_) => UnitError::Validation(message),
        _ => classify_provider_message(&message),
    }
}

/// Every standalone three-digit number in `lower` (no adjacent digits).
fn status_codes(lower: &str) -> impl Iterator<Item = u16> + '_ {
    lower
        .split(|c: char| !c.is_ascii_digit())
        .filter(|t| t.len() == 3)
        .filter_map(|t| t.parse().ok())
}

/// Map a provider error message to the unit error taxonomy.
///
/// Every 4xx other than 429 is fatal. Anything unrecognised is treated as
/// transient: a spurious retry costs one call, a spurious fatal loses the
/// unit.
pub fn classify_provider_message(message: &str) -> UnitError {
    let lower = message.to_ascii_lowercase();

    if status_codes(&lower).any(|c| c == 429)
        || lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("quota")
        || lower.contains("resource_exhausted")
        || lower.contains("too many requests")
    {
        return UnitError::RateLimited(message.to_string());
    }

    let fatal = status_codes(&lower).any(|c| (400..500).contains(&c))
        || lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("invalid api key")
        || lower.contains("invalid_api_key")
        || lower.contains("permission denied")
        || lower.contains("content_filter")
        || lower.contains("invalid request")
        || lower.contains("invalid_request")
        || lower.contains("model not found")
        || lower.contains("not supported")
        || lower.contains("token limit exceeded")
        || lower.contains("configuration error");
    if fatal {
        return UnitError::Fatal(message.to_string());
    }

    UnitError::Transient(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_are_retryable() {
        assert!(matches!(
            classify_provider_message("API error: HTTP 429 Too Many Requests"),
            UnitError::RateLimited(_)
        ));
        assert!(matches!(
            classify_provider_message("RESOURCE_EXHAUSTED: quota exceeded"),
            UnitError::RateLimited(_)
        ));
    }

    #[test]
    fn client_errors_are_fatal() {
        for msg in [
            "HTTP 401 Unauthorized",
            "status 400: malformed body",
            "Invalid API key provided",
            "finish_reason=content_filter",
            "403 Forbidden",
        ] {
            assert!(
                matches!(classify_provider_message(msg), UnitError::Fatal(_)),
                "{msg}"
            );
        }
    }

    #[test]
    fn every_client_status_but_429_is_fatal() {
        for msg in [
            "HTTP 402 Payment Required",
            "HTTP 405 Method Not Allowed",
            "API error: 418",
            "Model not found: gpt-9",
        ] {
            assert!(
                matches!(classify_provider_message(msg), UnitError::Fatal(_)),
                "{msg}"
            );
        }
    }

    #[test]
    fn typed_provider_errors_map_by_variant() {
        for e in [
            LlmError::ModelNotFound("gpt-9".into()),
            LlmError::ConfigError("missing key".into()),
            LlmError::NotSupported("vision".into()),
            LlmError::TokenLimitExceeded { max: 100, got: 200 },
            LlmError::InvalidRequest("bad field".into()),
            LlmError::AuthError("expired".into()),
        ] {
            assert!(
                matches!(classify_provider_error(&e), UnitError::Fatal(_)),
                "{e}"
            );
        }
        assert!(matches!(
            classify_provider_error(&LlmError::RateLimited("slow down".into())),
            UnitError::RateLimited(_)
        ));
        assert!(matches!(
            classify_provider_error(&LlmError::NetworkError("reset".into())),
            UnitError::Transient(_)
        ));
        assert!(matches!(
            classify_provider_error(&LlmError::Timeout),
            UnitError::Transient(_)
        ));
        assert!(matches!(
            classify_provider_error(&LlmError::ApiError("HTTP 503".into())),
            UnitError::Transient(_)
        ));
    }

    #[test]
    fn server_and_network_errors_are_transient() {
        for msg in [
            "HTTP 503 Service Unavailable",
            "500 internal error",
            "connection reset by peer",
            "request timed out",
        ] {
            assert!(
                matches!(classify_provider_message(msg), UnitError::Transient(_)),
                "{msg}"
            );
        }
    }

    #[test]
    fn status_match_ignores_longer_numbers() {
        // "4001" is a token count, not a status code.
        assert!(matches!(
            classify_provider_message("stream ended after 4001 tokens"),
            UnitError::Transient(_)
        ));
    }

    #[test]
    fn request_builder_drops_empty_context() {
        let r = ModelRequest::new("t", "sys").context(Some(String::new()));
        assert!(r.context.is_none());
        let r = ModelRequest::new("t", "sys").content("abc").context(Some("xy".into()));
        assert_eq!(r.payload_bytes(), 3 + 3 + 2);
    }

    #[test]
    fn context_goes_in_its_own_message() {
        let r = ModelRequest::new("t", "sys").content("body").context(Some("prior".into()));
        assert_eq!(build_messages(&r).len(), 3);
        let r = ModelRequest::new("t", "sys").content("body");
        assert_eq!(build_messages(&r).len(), 2);
    }
}
