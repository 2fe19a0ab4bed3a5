//! LLM Client implementation
//!
//! Supports the providers bots can be assigned to:
//! - OpenAI-compatible API (OpenAI, Groq, DeepSeek, local llama.cpp server)
//! - Anthropic Messages API
//! - Google Generative AI (Gemini)

use super::chat::{ChatMessage, ChatRequest, ChatResponse, MessageRole, Usage};
use super::ChatModel;
use crate::config::{LabConfig, ModelSpec, Provider};
use crate::error::{LabError, Result};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::util::{sanitize_base_url, validate_api_key};
use async_trait::async_trait;
use rand::Rng;
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client as HttpClient, StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Local models get at least this temperature
const LOCAL_MIN_TEMPERATURE: f32 = 0.8;
/// Local models never generate more than this
const LOCAL_MAX_TOKENS: u32 = 256;

/// Connection and sampling settings for one model
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: Provider,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Retries for 429, 5xx and transport errors; 0 disables retrying
    pub max_retries: u32,
    /// First backoff delay, doubled per attempt
    pub retry_delay: Duration,
}

impl LlmConfig {
    /// Build the config for a roster model.
    ///
    /// Local models get a raised temperature and a capped token budget.
    pub fn for_model<F>(spec: &ModelSpec, lab: &LabConfig, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = match spec.api_key_env() {
            Some(var) => Some(
                lookup(var)
                    .filter(|k| !k.trim().is_empty())
                    .ok_or_else(|| LabError::MissingConfig {
                        key: var.to_string(),
                    })?,
            ),
            None => None,
        };

        let mut config = Self {
            provider: spec.provider,
            base_url: lab.base_url_for(spec.provider),
            api_key,
            model: spec.model_id.clone(),
            max_tokens: lab.bots.max_tokens,
            temperature: lab.bots.temperature,
            max_retries: if lab.bots.throttle {
                lab.bots.max_retries
            } else {
                0
            },
            retry_delay: Duration::from_secs(3),
        };

        if spec.provider == Provider::Local {
            config.temperature = config.temperature.max(LOCAL_MIN_TEMPERATURE);
            config.max_tokens = config.max_tokens.min(LOCAL_MAX_TOKENS);
        }
        Ok(config)
    }
}

/// Main LLM Client
#[derive(Debug, Clone)]
pub struct LlmClient {
    config: LlmConfig,
    http_client: HttpClient,
    /// Shared across all clients of a run when throttling is on
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        sanitize_base_url(&config.base_url, "Base URL")?;
        if let Some(key) = &config.api_key {
            validate_api_key(key)?;
        }

        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(300))
            .user_agent(concat!("llmlab/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LabError::Http(format!("Failed to build HTTP client: {}", e)))?;

        Ok(LlmClient {
            config,
            http_client,
            rate_limiter: None,
        })
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Send a chat request and get a response
    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let estimated_tokens = request.estimated_tokens();
        tracing::debug!(
            "Chat request: provider={}, model={}, messages={}, estimated_tokens={}",
            self.config.provider,
            self.config.model,
            request.messages.len(),
            estimated_tokens
        );

        let _permit = match &self.rate_limiter {
            Some(limiter) => Some(
                limiter
                    .acquire(&self.config.base_url, estimated_tokens)
                    .await?,
            ),
            None => None,
        };

        let started = std::time::Instant::now();
        let result = match self.config.provider {
            Provider::Anthropic => self.chat_anthropic(request).await,
            Provider::Google => self.chat_gemini(request).await,
            Provider::Openai | Provider::Groq | Provider::Deepseek | Provider::Local => {
                self.chat_openai(request).await
            }
        };

        match &result {
            Ok(response) => {
                if let Some(limiter) = &self.rate_limiter {
                    limiter.record_success(&self.config.base_url);
                    if let Some(usage) = response.usage {
                        limiter.record_usage(
                            &self.config.base_url,
                            usage.total_tokens,
                            estimated_tokens,
                        );
                    }
                }
                tracing::debug!(
                    "Chat completed in {:?}: model={}, usage={:?}",
                    started.elapsed(),
                    self.config.model,
                    response.usage
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Chat failed after {:?}: model={}: {}",
                    started.elapsed(),
                    self.config.model,
                    e
                );
            }
        }
        result
    }

    /// Send with jittered backoff, respecting Retry-After headers.
    ///
    /// Non-success statuses are mapped onto `LabError`; only errors that
    /// report `is_retryable` are retried.
    async fn retry_with_backoff<F, Fut>(&self, operation: F) -> Result<reqwest::Response>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
    {
        let max_retries = self.config.max_retries;
        let mut attempt = 0;
        let mut delay = self.config.retry_delay;

        loop {
            let err = match operation().await {
                Ok(response) => match check_status(response).await {
                    Ok(response) => return Ok(response),
                    Err(e) => e,
                },
                Err(e) => LabError::from(e),
            };

            if let LabError::RateLimited { retry_after } = &err {
                if let Some(limiter) = &self.rate_limiter {
                    limiter.record_rate_limit_error(&self.config.base_url, *retry_after);
                    if limiter.is_circuit_open(&self.config.base_url) {
                        tracing::warn!(
                            "{} keeps rate limiting, pausing requests to {}",
                            self.config.provider,
                            self.config.base_url
                        );
                    }
                }
            }
            if attempt >= max_retries || !err.is_retryable() {
                return Err(err);
            }

            let wait = err.retry_delay().unwrap_or(delay);
            tracing::warn!(
                "{} request failed: {}, retrying in {:?} (attempt {}/{})",
                self.config.provider,
                err,
                wait,
                attempt + 1,
                max_retries
            );
            sleep(wait).await;
            attempt += 1;
            delay = next_delay(delay);
        }
    }

    /// OpenAI-compatible API chat
    async fn chat_openai(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let base_url = sanitize_base_url(&self.config.base_url, "Base URL")?;
        let url = format!("{}/chat/completions", base_url);

        let body = OpenAiRequest {
            model: &self.config.model,
            messages: request
                .messages
                .iter()
                .map(|m| OpenAiMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
            temperature: request.temperature.unwrap_or(self.config.temperature),
            stream: false,
        };

        let headers = self.build_headers()?;
        let response = self
            .retry_with_backoff(|| async {
                self.http_client
                    .post(&url)
                    .headers(headers.clone())
                    .json(&body)
                    .send()
                    .await
            })
            .await?;

        let text = response.text().await?;
        let body: OpenAiResponse =
            serde_json::from_str(&text).map_err(|e| LabError::InvalidResponse {
                reason: format!("Failed to parse OpenAI-compatible response: {}", e),
            })?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LabError::InvalidResponse {
                reason: "response has no choices".to_string(),
            })?;

        Ok(ChatResponse {
            model: if body.model.is_empty() {
                self.config.model.clone()
            } else {
                body.model
            },
            content: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason,
            usage: body.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }

    /// Anthropic Messages API chat
    async fn chat_anthropic(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let base_url = sanitize_base_url(&self.config.base_url, "Base URL")?;
        let url = format!("{}/v1/messages", base_url);

        let turns = request.alternating_turns();
        let body = AnthropicRequest {
            model: &self.config.model,
            system: request.system_text(),
            messages: turns
                .iter()
                .map(|m| AnthropicMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
            temperature: request.temperature.unwrap_or(self.config.temperature),
        };

        let headers = self.build_headers()?;
        let response = self
            .retry_with_backoff(|| async {
                self.http_client
                    .post(&url)
                    .headers(headers.clone())
                    .json(&body)
                    .send()
                    .await
            })
            .await?;

        let text = response.text().await?;
        let body: AnthropicResponse =
            serde_json::from_str(&text).map_err(|e| LabError::InvalidResponse {
                reason: format!("Failed to parse Anthropic response: {}", e),
            })?;

        let content = body
            .content
            .iter()
            .filter(|b| b.type_ == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(ChatResponse {
            model: body.model.unwrap_or_else(|| self.config.model.clone()),
            content,
            finish_reason: body.stop_reason,
            usage: body.usage.map(|u| Usage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
                total_tokens: u.input_tokens + u.output_tokens,
            }),
        })
    }

    /// Google Gemini API chat
    async fn chat_gemini(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let contents: Vec<GeminiContent> = request
            .alternating_turns()
            .into_iter()
            .map(|m| GeminiContent {
                role: match m.role {
                    MessageRole::Assistant => "model".to_string(),
                    _ => "user".to_string(),
                },
                parts: vec![GeminiPart { text: m.content }],
            })
            .collect();

        let system_instruction = request.system_text().map(|text| GeminiContent {
            role: "system".to_string(),
            parts: vec![GeminiPart { text }],
        });

        let base_url = sanitize_base_url(&self.config.base_url, "Base URL")?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            base_url, self.config.model
        );

        let body = GeminiRequest {
            contents,
            system_instruction,
            generation_config: Some(GeminiGenerationConfig {
                max_output_tokens: Some(request.max_tokens.unwrap_or(self.config.max_tokens)),
                temperature: Some(request.temperature.unwrap_or(self.config.temperature)),
            }),
        };

        let headers = self.build_headers()?;
        let response = self
            .retry_with_backoff(|| async {
                self.http_client
                    .post(&url)
                    .headers(headers.clone())
                    .json(&body)
                    .send()
                    .await
            })
            .await?;

        let text = response.text().await?;
        let body: GeminiResponse =
            serde_json::from_str(&text).map_err(|e| LabError::InvalidResponse {
                reason: format!("Failed to parse Gemini response: {}", e),
            })?;

        let candidate = body
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LabError::InvalidResponse {
                reason: "response has no candidates".to_string(),
            })?;

        Ok(ChatResponse {
            model: self.config.model.clone(),
            content: candidate
                .content
                .map(|c| {
                    c.parts
                        .into_iter()
                        .map(|p| p.text)
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default(),
            finish_reason: candidate.finish_reason,
            usage: body.usage_metadata.map(|u| Usage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            }),
        })
    }

    /// Build headers for API requests
    fn build_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let api_key = match &self.config.api_key {
            Some(key) => Some(validate_api_key(key)?),
            None => None,
        };

        match self.config.provider {
            Provider::Anthropic => {
                if let Some(key) = api_key {
                    headers.insert("x-api-key", header_value(&key)?);
                }
                headers.insert(
                    "anthropic-version",
                    HeaderValue::from_static(ANTHROPIC_VERSION),
                );
            }
            Provider::Google => {
                if let Some(key) = api_key {
                    headers.insert("x-goog-api-key", header_value(&key)?);
                }
            }
            Provider::Openai | Provider::Groq | Provider::Deepseek | Provider::Local => {
                if let Some(key) = api_key {
                    headers.insert(
                        "Authorization",
                        header_value(&format!("Bearer {}", key))?,
                    );
                }
            }
        }

        Ok(headers)
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        LlmClient::chat(self, request).await
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// Build the shared limiter for a run, or none when throttling is off
pub fn shared_rate_limiter(lab: &LabConfig) -> Option<Arc<RateLimiter>> {
    lab.bots.throttle.then(|| {
        Arc::new(RateLimiter::new(RateLimitConfig::with_rpm(
            lab.bots.requests_per_minute,
        )))
    })
}

fn header_value(value: &str) -> Result<HeaderValue> {
    value.parse().map_err(|_| LabError::InvalidConfig {
        message: "API key is not a valid header value".to_string(),
    })
}

fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Double the delay and add up to +/- 500ms of jitter, bounded by half the
/// delay so short test delays stay positive.
fn next_delay(delay: Duration) -> Duration {
    let doubled = delay.saturating_mul(2);
    let bound = (doubled.as_millis() as i64 / 2).min(500);
    let jitter_ms = if bound > 0 {
        rand::thread_rng().gen_range(-bound..=bound)
    } else {
        0
    };
    let delay_ms = (doubled.as_millis() as i64 + jitter_ms).max(0) as u64;
    Duration::from_millis(delay_ms)
}

/// Map a non-success status onto the error taxonomy
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = retry_after_header(response.headers());
    let error_body: Option<serde_json::Value> = response.json().await.ok();
    let message = error_body
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|e| e.get("message").or(Some(e)))
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown error")
        .to_string();

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LabError::Unauthorized { message },
        StatusCode::TOO_MANY_REQUESTS => LabError::RateLimited { retry_after },
        status => LabError::Provider {
            status: status.as_u16(),
            message,
        },
    })
}

// OpenAI-compatible API types
#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// Anthropic API types
#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

// Gemini API types
#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Serialize, Deserialize, Clone)]
struct GeminiContent {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize, Clone)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(provider: Provider, base_url: &str) -> LlmConfig {
        LlmConfig {
            provider,
            base_url: base_url.to_string(),
            api_key: Some("test-key".to_string()),
            model: "test-model".to_string(),
            max_tokens: 64,
            temperature: 0.5,
            max_retries: 2,
            retry_delay: Duration::from_millis(5),
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new(vec![
            ChatMessage::system("Answer in JSON."),
            ChatMessage::user("Pick R, P or S"),
        ])
    }

    #[tokio::test]
    async fn test_openai_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({
                "model": "test-model",
                "max_tokens": 64,
                "messages": [
                    {"role": "system", "content": "Answer in JSON."},
                    {"role": "user", "content": "Pick R, P or S"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "model": "test-model",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "{\"answers\":{}}"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            LlmClient::new(config(Provider::Groq, &format!("{}/v1", server.uri()))).unwrap();
        let response = client.chat(&request()).await.unwrap();
        assert_eq!(response.content, "{\"answers\":{}}");
        assert_eq!(response.usage.unwrap().total_tokens, 15);
    }

    #[tokio::test]
    async fn test_anthropic_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(json!({
                "system": "Answer in JSON.",
                "messages": [{"role": "user", "content": "Pick R, P or S"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "model": "claude-test",
                "content": [{"type": "text", "text": "{\"summary\":\"ok\"}"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 7, "output_tokens": 3}
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(config(Provider::Anthropic, &server.uri())).unwrap();
        let response = client.chat(&request()).await.unwrap();
        assert_eq!(response.content, "{\"summary\":\"ok\"}");
        assert_eq!(response.model, "claude-test");
        assert_eq!(response.usage.unwrap().total_tokens, 10);
    }

    #[tokio::test]
    async fn test_gemini_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/test-model:generateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_partial_json(json!({
                "system_instruction": {"parts": [{"text": "Answer in JSON."}]},
                "contents": [{"role": "user", "parts": [{"text": "Pick R, P or S"}]}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "R"}]}, "finishReason": "STOP", "index": 0}],
                "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 1, "totalTokenCount": 5}
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(config(Provider::Google, &server.uri())).unwrap();
        let response = client.chat(&request()).await.unwrap();
        assert_eq!(response.content, "R");
        assert_eq!(response.finish_reason.as_deref(), Some("STOP"));
    }

    #[tokio::test]
    async fn test_gemini_key_stays_out_of_errors() {
        let mut config = config(Provider::Google, "http://127.0.0.1:9");
        config.api_key = Some("SECRETKEY123".to_string());
        config.model = "m".to_string();
        config.max_retries = 0;

        let client = LlmClient::new(config).unwrap();
        let err = client.chat(&request()).await.unwrap_err();
        assert!(matches!(err, LabError::ConnectionFailed { .. }));
        assert!(!err.to_string().contains("SECRETKEY123"), "{}", err);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "ok"}}]
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(config(Provider::Openai, &server.uri())).unwrap();
        let response = client.chat(&request()).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .mount(&server)
            .await;

        let client = LlmClient::new(config(Provider::Openai, &server.uri())).unwrap();
        let err = client.chat(&request()).await.unwrap_err();
        assert!(matches!(err, LabError::RateLimited { .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_repeated_429s_open_the_circuit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .mount(&server)
            .await;

        let mut config = config(Provider::Openai, &server.uri());
        config.max_retries = 4;
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
        let client = LlmClient::new(config).unwrap().with_rate_limiter(limiter.clone());

        assert!(client.chat(&request()).await.is_err());
        assert_eq!(server.received_requests().await.unwrap().len(), 5);
        assert!(limiter.is_circuit_open(&server.uri()));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "max_tokens too large"}
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(config(Provider::Openai, &server.uri())).unwrap();
        let err = client.chat(&request()).await.unwrap_err();
        assert!(matches!(err, LabError::Provider { status: 400, .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_mapping_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "invalid api key"}
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(config(Provider::Openai, &server.uri())).unwrap();
        let err = client.chat(&request()).await.unwrap_err();
        assert!(matches!(err, LabError::Unauthorized { ref message } if message == "invalid api key"));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[test]
    fn test_local_model_adjustments() {
        let mut lab = LabConfig::default();
        lab.bots.temperature = 0.2;
        lab.bots.max_tokens = 1024;

        let local = ModelSpec::new(Provider::Local, "tinyllama");
        let config = LlmConfig::for_model(&local, &lab, |_| None).unwrap();
        assert_eq!(config.temperature, LOCAL_MIN_TEMPERATURE);
        assert_eq!(config.max_tokens, LOCAL_MAX_TOKENS);
        assert_eq!(config.base_url, "http://localhost:8080/v1");
        assert!(config.api_key.is_none());

        let remote = ModelSpec::new(Provider::Openai, "gpt-4o-mini");
        assert!(matches!(
            LlmConfig::for_model(&remote, &lab, |_| None),
            Err(LabError::MissingConfig { .. })
        ));

        lab.bots.throttle = false;
        let config =
            LlmConfig::for_model(&remote, &lab, |_| Some("sk-test".to_string())).unwrap();
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.max_retries, 0);
        assert!(shared_rate_limiter(&lab).is_none());
    }

    #[test]
    fn test_next_delay_grows() {
        let delay = next_delay(Duration::from_secs(3));
        assert!(delay >= Duration::from_millis(5500));
        assert!(delay <= Duration::from_millis(6500));
        assert_eq!(next_delay(Duration::ZERO), Duration::ZERO);
    }
}
