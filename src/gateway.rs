//! Completion gateway: the single chokepoint through which every engine
//! reaches the language model.
//!
//! Centralising retry, backoff, and timeout policy here means the
//! extraction, translation, and summarisation engines never duplicate it.
//! Engines hand the gateway a [`CompletionRequest`] and get back either text
//! or a classified [`CompletionError`]; only the gateway decides what is
//! worth retrying.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 / timeouts are transient and frequent under concurrent
//! load. Exponential backoff (`retry_backoff_ms * 2^attempt`) avoids
//! thundering-herd: with 500 ms base and 3 retries the wait sequence is
//! 500 ms → 1 s → 2 s, totalling < 4 s of back-off per call. Invalid
//! requests and content-policy rejections are permanent and surface
//! immediately.

use crate::config::{LlmConfig, PipelineConfig};
use crate::error::PolydocError;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// One completion request: prompt text plus generation parameters.
///
/// Ephemeral — one per gateway call, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_output_tokens: usize,
    pub temperature: f32,
}

/// The model's raw reply.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
}

/// Classified completion failure.
///
/// Exactly the error kinds of the gateway protocol; [`is_transient`]
/// determines retry eligibility.
///
/// [`is_transient`]: CompletionError::is_transient
#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    /// HTTP 429. Retried with backoff; honours a server-specified delay.
    #[error("rate limited{}", retry_after_secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    /// The call exceeded the response-size/timeout ceiling.
    #[error("completion timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The service rejected the request as malformed (4xx). Never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Content-policy rejection. Never retried.
    #[error("content rejected: {0}")]
    ContentRejected(String),

    /// 5xx or network failure. Retried.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The service answered 200 but the body was not usable.
    #[error("malformed completion response: {0}")]
    MalformedResponse(String),
}

impl CompletionError {
    /// Only rate-limits, timeouts, and 5xx-class failures are retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CompletionError::RateLimited { .. }
                | CompletionError::Timeout { .. }
                | CompletionError::ServiceUnavailable(_)
        )
    }

    /// Promote an exhausted (or permanent) completion error to the
    /// pipeline-level taxonomy, tagged with the engine that hit it.
    pub fn into_fatal(self, task: &str, retries: u32) -> PolydocError {
        match self {
            CompletionError::RateLimited { .. } => PolydocError::RateLimited {
                task: task.to_string(),
                retries,
            },
            CompletionError::Timeout { elapsed_ms } => PolydocError::CompletionTimeout {
                task: task.to_string(),
                elapsed_ms,
            },
            CompletionError::InvalidRequest(detail) => PolydocError::InvalidRequest {
                task: task.to_string(),
                detail,
            },
            CompletionError::ContentRejected(detail) => PolydocError::ContentRejected {
                task: task.to_string(),
                detail,
            },
            CompletionError::ServiceUnavailable(detail)
            | CompletionError::MalformedResponse(detail) => PolydocError::ServiceUnavailable {
                task: task.to_string(),
                retries,
                detail,
            },
        }
    }
}

/// A black-box text-completion capability.
///
/// Production uses [`GeminiBackend`]; tests inject scripted mocks. The trait
/// is deliberately minimal so a mock is a dozen lines.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError>;
}

/// Cooperative cancellation for one pipeline run.
///
/// Cancelling stops the engines from *issuing new* gateway calls; in-flight
/// calls run to completion so already-paid work is kept for a later retry.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Call/retry counters accumulated across one run, reported in
/// [`crate::output::RunStats`].
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    calls: AtomicU64,
    retries: AtomicU64,
}

impl GatewayMetrics {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// The retrying wrapper around a [`CompletionBackend`].
///
/// Cheap to clone; all engines of one run share the same instance so the
/// metrics cover the whole document.
#[derive(Clone)]
pub struct CompletionGateway {
    backend: Arc<dyn CompletionBackend>,
    max_retries: u32,
    retry_backoff_ms: u64,
    api_timeout: Duration,
    max_response_bytes: usize,
    metrics: Arc<GatewayMetrics>,
}

impl CompletionGateway {
    pub fn new(backend: Arc<dyn CompletionBackend>, config: &PipelineConfig) -> Self {
        Self {
            backend,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            api_timeout: Duration::from_secs(config.api_timeout_secs),
            max_response_bytes: config.max_response_bytes,
            metrics: Arc::new(GatewayMetrics::default()),
        }
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Retry budget, for error reporting by the engines.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Send a completion request, retrying transient failures with
    /// exponential backoff up to the configured budget.
    ///
    /// `task` labels the calling engine ("detect", "extract", "translate",
    /// "summarize") in logs and errors. Permanent failures surface on the
    /// first attempt; after the budget is exhausted the last transient error
    /// is returned.
    pub async fn complete(
        &self,
        task: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        let mut last_err: Option<CompletionError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = match &last_err {
                    // A server-specified delay overrides our schedule.
                    Some(CompletionError::RateLimited {
                        retry_after_secs: Some(secs),
                    }) => Duration::from_secs(*secs),
                    _ => Duration::from_millis(self.retry_backoff_ms * 2u64.pow(attempt - 1)),
                };
                warn!(
                    "{task}: retry {}/{} after {:?}",
                    attempt, self.max_retries, backoff
                );
                self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                sleep(backoff).await;
            }

            self.metrics.calls.fetch_add(1, Ordering::Relaxed);
            let start = Instant::now();

            let outcome = match timeout(self.api_timeout, self.backend.complete(request)).await {
                Ok(result) => result,
                Err(_) => Err(CompletionError::Timeout {
                    elapsed_ms: start.elapsed().as_millis() as u64,
                }),
            };

            match outcome {
                Ok(response) => {
                    if response.text.len() > self.max_response_bytes {
                        // Oversize responses are timeout-class: the model is
                        // looping and further retries share the budget.
                        last_err = Some(CompletionError::Timeout {
                            elapsed_ms: start.elapsed().as_millis() as u64,
                        });
                        continue;
                    }
                    debug!(
                        "{task}: completion ok, {} chars in {:?}",
                        response.text.len(),
                        start.elapsed()
                    );
                    return Ok(response);
                }
                Err(e) if e.is_transient() => {
                    warn!("{task}: attempt {} failed — {e}", attempt + 1);
                    last_err = Some(e);
                }
                Err(e) => {
                    warn!("{task}: permanent failure — {e}");
                    return Err(e);
                }
            }
        }

        Err(last_err.unwrap_or(CompletionError::ServiceUnavailable(
            "no attempt was made".to_string(),
        )))
    }
}

// ── Production backend ───────────────────────────────────────────────────

/// HTTP backend speaking the Gemini `generateContent` protocol.
///
/// The endpoint and credentials come from an [`LlmConfig`] constructed once
/// at startup — no ambient environment lookups happen here.
pub struct GeminiBackend {
    http: reqwest::Client,
    config: LlmConfig,
}

impl GeminiBackend {
    pub fn new(config: LlmConfig) -> Result<Self, PolydocError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| PolydocError::Internal(format!("http client: {e}")))?;
        Ok(Self { http, config })
    }

    fn completion_url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[async_trait]
impl CompletionBackend for GeminiBackend {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        let body = json!({
            "contents": [{ "parts": [{ "text": request.prompt }] }],
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_output_tokens,
            },
        });

        let response = self
            .http
            .post(self.completion_url())
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::Timeout { elapsed_ms: 0 }
                } else {
                    CompletionError::ServiceUnavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(CompletionError::RateLimited { retry_after_secs });
        }
        if status.is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(CompletionError::InvalidRequest(format!(
                "HTTP {status}: {detail}"
            )));
        }
        if !status.is_success() {
            return Err(CompletionError::ServiceUnavailable(format!(
                "HTTP {status}"
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CompletionError::MalformedResponse(e.to_string()))?;

        // Safety blocks come back as 200 with a block reason instead of text.
        if let Some(reason) = payload
            .pointer("/promptFeedback/blockReason")
            .and_then(|v| v.as_str())
        {
            return Err(CompletionError::ContentRejected(reason.to_string()));
        }
        if let Some("SAFETY") = payload
            .pointer("/candidates/0/finishReason")
            .and_then(|v| v.as_str())
        {
            return Err(CompletionError::ContentRejected("SAFETY".to_string()));
        }

        let text: String = payload
            .pointer("/candidates/0/content/parts")
            .and_then(|v| v.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(CompletionError::MalformedResponse(
                "response contained no candidate text".to_string(),
            ));
        }

        Ok(CompletionResponse { text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Backend that plays a script of outcomes, one per call.
    struct ScriptedBackend {
        script: Mutex<Vec<Result<CompletionResponse, CompletionError>>>,
        calls: AtomicU64,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<CompletionResponse, CompletionError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionResponse, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().unwrap().remove(0)
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            prompt: "hello".into(),
            max_output_tokens: 64,
            temperature: 0.3,
        }
    }

    fn ok(text: &str) -> Result<CompletionResponse, CompletionError> {
        Ok(CompletionResponse { text: text.into() })
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(CompletionError::ServiceUnavailable("503".into())),
            Err(CompletionError::RateLimited {
                retry_after_secs: None,
            }),
            ok("done"),
        ]));
        let gateway =
            CompletionGateway::new(backend.clone(), &PipelineConfig::default());

        let response = gateway.complete("test", &request()).await.unwrap();
        assert_eq!(response.text, "done");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(gateway.metrics().retries(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(
            CompletionError::InvalidRequest("bad".into()),
        )]));
        let gateway =
            CompletionGateway::new(backend.clone(), &PipelineConfig::default());

        let err = gateway.complete("test", &request()).await.unwrap_err();
        assert!(matches!(err, CompletionError::InvalidRequest(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.metrics().retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn content_rejection_is_not_retried() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(
            CompletionError::ContentRejected("SAFETY".into()),
        )]));
        let gateway =
            CompletionGateway::new(backend.clone(), &PipelineConfig::default());

        let err = gateway.complete("test", &request()).await.unwrap_err();
        assert!(matches!(err, CompletionError::ContentRejected(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_exhaustion_returns_last_error() {
        let config = PipelineConfig::builder().max_retries(2).build().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(CompletionError::ServiceUnavailable("a".into())),
            Err(CompletionError::ServiceUnavailable("b".into())),
            Err(CompletionError::ServiceUnavailable("c".into())),
        ]));
        let gateway = CompletionGateway::new(backend.clone(), &config);

        let err = gateway.complete("test", &request()).await.unwrap_err();
        assert!(matches!(err, CompletionError::ServiceUnavailable(ref d) if d == "c"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn oversize_response_is_timeout_class() {
        let config = PipelineConfig::builder()
            .max_retries(0)
            .max_response_bytes(1024)
            .build()
            .unwrap();
        let huge = "x".repeat(5000);
        let backend = Arc::new(ScriptedBackend::new(vec![ok(&huge)]));
        let gateway = CompletionGateway::new(backend, &config);

        let err = gateway.complete("test", &request()).await.unwrap_err();
        assert!(matches!(err, CompletionError::Timeout { .. }));
    }

    #[test]
    fn transient_classification_matches_protocol() {
        assert!(CompletionError::RateLimited {
            retry_after_secs: None
        }
        .is_transient());
        assert!(CompletionError::Timeout { elapsed_ms: 1 }.is_transient());
        assert!(CompletionError::ServiceUnavailable("x".into()).is_transient());
        assert!(!CompletionError::InvalidRequest("x".into()).is_transient());
        assert!(!CompletionError::ContentRejected("x".into()).is_transient());
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
