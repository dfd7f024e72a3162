//! Hosted chat-model clients and the shared retry/backoff controller.
//!
//! Every external generative-model call in the system goes through
//! [`call_with_retry`]: rate-limit failures are retried with exponential
//! backoff (waits of `base * 2^attempt`), any other failure is surfaced
//! immediately, and an exhausted budget yields [`LlmError::Exhausted`].
//!
//! On top of the controller sit two call-site policies:
//! - the chat path ([`generate_lenient`]) always yields *some* text,
//!   substituting fixed degraded messages for failures;
//! - the extraction path propagates the error so it can be reported as a
//!   structured JSON payload.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;

use crate::config::LlmConfig;

/// Degraded answer substituted when the model fails with a non-rate-limit
/// error.
pub const DEGRADED_MESSAGE: &str = "Sorry, I encountered an error processing your request.";

/// Answer substituted once the rate-limit retry budget is exhausted.
pub const UNAVAILABLE_MESSAGE: &str =
    "I am currently experiencing issues. Please try again later.";

/// Chat-model failures. `RateLimited` is the only retryable variant.
#[derive(Debug)]
pub enum LlmError {
    /// Provider signalled a rate limit (HTTP 429).
    RateLimited(String),
    /// Any other provider-side error response.
    Api(String),
    /// Transport-level failure.
    Network(String),
    /// The response body did not have the expected shape.
    InvalidResponse(String),
    /// The retry budget was exhausted without a successful call.
    Exhausted,
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmError::RateLimited(msg) => write!(f, "rate limited: {}", msg),
            LlmError::Api(msg) => write!(f, "model API error: {}", msg),
            LlmError::Network(msg) => write!(f, "network error: {}", msg),
            LlmError::InvalidResponse(msg) => write!(f, "invalid model response: {}", msg),
            LlmError::Exhausted => write!(f, "model unavailable after retries"),
        }
    }
}

impl std::error::Error for LlmError {}

/// Trait for hosted generative models.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Generate a text completion for a plain prompt.
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;

    /// Generate a completion for a prompt plus an inline image.
    async fn generate_with_image(
        &self,
        _prompt: &str,
        _image: &[u8],
        _mime: &str,
    ) -> Result<String, LlmError> {
        Err(LlmError::Api(format!(
            "model '{}' does not support image input",
            self.model_name()
        )))
    }
}

// ============ Retry/backoff controller ============

/// Retry discipline for rate-limited calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempt budget (default 3).
    pub max_attempts: u32,
    /// Base wait; attempt `n` waits `base_delay * 2^n`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            base_delay: Duration::from_secs(config.base_delay_secs),
        }
    }

    /// Wait before the next attempt: `base_delay * 2^attempt`
    /// (1, 2, 4, ... time units).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Run `call` under the retry policy.
///
/// Rate-limit errors wait `base * 2^attempt` and retry, up to the attempt
/// budget; any other error returns immediately; an exhausted budget returns
/// [`LlmError::Exhausted`].
pub async fn call_with_retry<F, Fut>(policy: &RetryPolicy, mut call: F) -> Result<String, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String, LlmError>>,
{
    for attempt in 0..policy.max_attempts {
        match call().await {
            Ok(text) => return Ok(text),
            Err(LlmError::RateLimited(msg)) => {
                let delay = policy.backoff_delay(attempt);
                tracing::warn!(
                    "rate limited (attempt {}/{}): {}; retrying in {:?}",
                    attempt + 1,
                    policy.max_attempts,
                    msg,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(other) => return Err(other),
        }
    }
    Err(LlmError::Exhausted)
}

/// Generate a completion through the retry controller.
pub async fn generate_with_retry(
    model: &dyn ChatModel,
    prompt: &str,
    policy: &RetryPolicy,
) -> Result<String, LlmError> {
    call_with_retry(policy, || model.generate(prompt)).await
}

/// Generate a completion, always yielding text.
///
/// The chat path chooses availability over failure propagation: the caller
/// receives a degraded default answer instead of an error.
pub async fn generate_lenient(model: &dyn ChatModel, prompt: &str, policy: &RetryPolicy) -> String {
    match generate_with_retry(model, prompt, policy).await {
        Ok(text) => text,
        Err(LlmError::Exhausted) => {
            tracing::warn!("model retry budget exhausted; returning unavailable message");
            UNAVAILABLE_MESSAGE.to_string()
        }
        Err(e) => {
            tracing::warn!("model call failed: {}; returning degraded message", e);
            DEGRADED_MESSAGE.to_string()
        }
    }
}

// ============ Provider factory ============

/// Create the configured [`ChatModel`].
///
/// Fails at construction when a required credential is missing, so a bad
/// configuration stops the process before it starts serving.
pub fn create_chat_model(config: &LlmConfig) -> anyhow::Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "gemini" => Ok(Arc::new(GeminiChat::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaChat::new(config)?)),
        other => anyhow::bail!("Unknown llm provider: {}", other),
    }
}

// ============ Gemini ============

/// Chat model backed by the Gemini generateContent API.
///
/// Requires the `GEMINI_API_KEY` environment variable. HTTP 429 maps to
/// [`LlmError::RateLimited`]; other error statuses to [`LlmError::Api`].
pub struct GeminiChat {
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiChat {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model: config.model.clone(),
            api_key,
            client,
        })
    }

    async fn generate_content(&self, parts: serde_json::Value) -> Result<String, LlmError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let body = serde_json::json!({
            "contents": [{ "parts": parts }]
        });

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let body_text = response.text().await.unwrap_or_default();
            return Err(LlmError::RateLimited(body_text));
        }
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{}: {}", status, body_text)));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        parse_gemini_response(&json)
    }
}

#[async_trait]
impl ChatModel for GeminiChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.generate_content(serde_json::json!([{ "text": prompt }]))
            .await
    }

    async fn generate_with_image(
        &self,
        prompt: &str,
        image: &[u8],
        mime: &str,
    ) -> Result<String, LlmError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        self.generate_content(serde_json::json!([
            { "text": prompt },
            { "inline_data": { "mime_type": mime, "data": encoded } }
        ]))
        .await
    }
}

/// Extract the concatenated text parts of the first Gemini candidate.
fn parse_gemini_response(json: &serde_json::Value) -> Result<String, LlmError> {
    let parts = json
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .ok_or_else(|| LlmError::InvalidResponse("missing candidates[0].content.parts".into()))?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("");

    if text.is_empty() {
        return Err(LlmError::InvalidResponse("empty candidate text".into()));
    }
    Ok(text)
}

// ============ Ollama ============

/// Chat model backed by a local Ollama instance (`POST /api/generate`).
pub struct OllamaChat {
    model: String,
    url: String,
    client: reqwest::Client,
}

impl OllamaChat {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model: config.model.clone(),
            url,
            client,
        })
    }

    async fn generate_body(&self, body: serde_json::Value) -> Result<String, LlmError> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let body_text = response.text().await.unwrap_or_default();
            return Err(LlmError::RateLimited(body_text));
        }
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{}: {}", status, body_text)));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::InvalidResponse("missing response field".into()))
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.generate_body(serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        }))
        .await
    }

    async fn generate_with_image(
        &self,
        prompt: &str,
        image: &[u8],
        _mime: &str,
    ) -> Result<String, LlmError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        self.generate_body(serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "images": [encoded],
            "stream": false,
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted model: fails `failures` times with the given error kind,
    /// then succeeds. Counts attempts.
    struct ScriptedModel {
        attempts: AtomicU32,
        failures: u32,
        rate_limited: bool,
    }

    impl ScriptedModel {
        fn always_rate_limited() -> Self {
            Self {
                attempts: AtomicU32::new(0),
                failures: u32::MAX,
                rate_limited: true,
            }
        }

        fn failing_then_ok(failures: u32, rate_limited: bool) -> Self {
            Self {
                attempts: AtomicU32::new(0),
                failures,
                rate_limited,
            }
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                if self.rate_limited {
                    Err(LlmError::RateLimited("429".into()))
                } else {
                    Err(LlmError::Api("boom".into()))
                }
            } else {
                Ok("model answer".to_string())
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn success_on_first_attempt_does_not_retry() {
        let model = ScriptedModel::failing_then_ok(0, true);
        let text = generate_with_retry(&model, "q", &fast_policy()).await.unwrap();
        assert_eq!(text, "model answer");
        assert_eq!(model.attempts(), 1);
    }

    #[tokio::test]
    async fn rate_limit_retries_up_to_budget_then_exhausts() {
        let model = ScriptedModel::always_rate_limited();
        let err = generate_with_retry(&model, "q", &fast_policy()).await.unwrap_err();
        assert!(matches!(err, LlmError::Exhausted));
        assert_eq!(model.attempts(), 3);
    }

    #[tokio::test]
    async fn rate_limit_recovers_within_budget() {
        let model = ScriptedModel::failing_then_ok(2, true);
        let text = generate_with_retry(&model, "q", &fast_policy()).await.unwrap();
        assert_eq!(text, "model answer");
        assert_eq!(model.attempts(), 3);
    }

    #[tokio::test]
    async fn non_rate_limit_error_is_not_retried() {
        let model = ScriptedModel::failing_then_ok(1, false);
        let err = generate_with_retry(&model, "q", &fast_policy()).await.unwrap_err();
        assert!(matches!(err, LlmError::Api(_)));
        assert_eq!(model.attempts(), 1);
    }

    #[tokio::test]
    async fn lenient_policy_substitutes_unavailable_message_on_exhaustion() {
        let model = ScriptedModel::always_rate_limited();
        let text = generate_lenient(&model, "q", &fast_policy()).await;
        assert_eq!(text, UNAVAILABLE_MESSAGE);
        assert_eq!(model.attempts(), 3);
    }

    #[tokio::test]
    async fn lenient_policy_substitutes_degraded_message_on_other_errors() {
        let model = ScriptedModel::failing_then_ok(1, false);
        let text = generate_lenient(&model, "q", &fast_policy()).await;
        assert_eq!(text, DEGRADED_MESSAGE);
        assert_eq!(model.attempts(), 1);
    }

    #[test]
    fn parses_gemini_candidates() {
        let json = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Rent is " }, { "text": "deductible." }] }
            }]
        });
        assert_eq!(parse_gemini_response(&json).unwrap(), "Rent is deductible.");

        let bad = serde_json::json!({ "candidates": [] });
        assert!(matches!(
            parse_gemini_response(&bad),
            Err(LlmError::InvalidResponse(_))
        ));
    }
}
