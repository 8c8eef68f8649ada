//! Configuration types for the document pipeline.
//!
//! All run behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configs across tasks, log them, and diff two runs to
//! understand why their outputs differ.
//!
//! # Design choice: builder over constructor
//! A fifteen-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on
//! documented defaults for the rest.
//!
//! Credentials live in [`LlmConfig`], constructed once at startup and passed
//! explicitly into the gateway — engines never read ambient state.

use crate::error::PolydocError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable model-service credentials and addressing.
///
/// Constructed once at process startup; the gateway holds it by value.
/// Nothing inside the engines looks up environment variables.
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key for the completion service.
    pub api_key: String,
    /// Model identifier, e.g. "gemini-2.0-flash-lite".
    pub model: String,
    /// Service base URL. The backend appends the per-model completion path.
    pub endpoint: String,
}

impl LlmConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Configuration for one pipeline run.
///
/// Built via [`PipelineConfig::builder()`] or [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use polydoc::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .concurrency(6)
///     .max_retries(2)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of concurrent gateway calls per run. Default: 8.
    ///
    /// Completion APIs are network-bound, not CPU-bound; dispatching batches
    /// in parallel cuts wall-clock time roughly linearly until the service
    /// starts rate-limiting. Lower this if you see 429s.
    pub concurrency: usize,

    /// Sampling temperature for completion calls. Default: 0.3.
    ///
    /// Low temperature keeps the model faithful to the source text, which is
    /// what translation and extraction want. Raising it buys nothing here.
    pub temperature: f32,

    /// Maximum tokens the model may generate per call. Default: 8192.
    pub max_output_tokens: usize,

    /// Maximum retry attempts on a transient gateway failure. Default: 3.
    ///
    /// Transient means rate-limit, timeout, or 5xx. Permanent failures
    /// (invalid request, content rejection) are never retried.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s, so N concurrent
    /// workers do not hammer a recovering endpoint in lockstep.
    pub retry_backoff_ms: u64,

    /// Per-completion-call timeout ceiling in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Maximum accepted response body size in bytes. Default: 1 MiB.
    ///
    /// Responses beyond this are treated as a timeout-class failure; a model
    /// looping on output should not exhaust memory.
    pub max_response_bytes: usize,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Character budget per translation batch. Default: 4000.
    ///
    /// Batching blocks keeps the request count low while staying inside the
    /// model context; one batch maps back to one translated string per block.
    pub batch_char_budget: usize,

    /// Character budget per extraction/summary chunk. Default: 12000.
    pub chunk_char_budget: usize,

    /// How many characters of document text the language detector samples.
    /// Default: 4000. Sampling a prefix bounds cost on huge documents.
    pub detect_sample_chars: usize,

    /// Minimum sample length below which the detector reports the unknown
    /// verdict instead of guessing. Default: 20.
    pub detect_min_chars: usize,

    /// Area-ratio tolerance under which a translation is placed as-is.
    /// Default: 1.05 (anything measured at ≤ 100% of the box always fits).
    pub fit_tolerance: f32,

    /// Smallest allowed font scale before switching to reflow. Default: 0.8.
    pub font_scale_floor: f32,

    /// Area ratio above which font scaling is abandoned in favour of
    /// reflow (or the appendix when the page has no room). Default: 1.5.
    pub reflow_cutoff: f32,

    /// Schema-repair round-trips for extraction. Default: 1.
    ///
    /// One bounded repair is the accepted mitigation for malformed model
    /// JSON; this is tunable policy, not a hard-coded truth.
    pub repair_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            temperature: 0.3,
            max_output_tokens: 8192,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 60,
            max_response_bytes: 1024 * 1024,
            password: None,
            batch_char_budget: 4000,
            chunk_char_budget: 12_000,
            detect_sample_chars: 4000,
            detect_min_chars: 20,
            fit_tolerance: 1.05,
            font_scale_floor: 0.8,
            reflow_cutoff: 1.5,
            repair_attempts: 1,
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_output_tokens(mut self, n: usize) -> Self {
        self.config.max_output_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn max_response_bytes(mut self, bytes: usize) -> Self {
        self.config.max_response_bytes = bytes.max(1024);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn batch_char_budget(mut self, n: usize) -> Self {
        self.config.batch_char_budget = n.max(200);
        self
    }

    pub fn chunk_char_budget(mut self, n: usize) -> Self {
        self.config.chunk_char_budget = n.max(1000);
        self
    }

    pub fn detect_sample_chars(mut self, n: usize) -> Self {
        self.config.detect_sample_chars = n.max(1);
        self
    }

    pub fn detect_min_chars(mut self, n: usize) -> Self {
        self.config.detect_min_chars = n;
        self
    }

    pub fn fit_tolerance(mut self, t: f32) -> Self {
        self.config.fit_tolerance = t.max(1.0);
        self
    }

    pub fn font_scale_floor(mut self, f: f32) -> Self {
        self.config.font_scale_floor = f.clamp(0.1, 1.0);
        self
    }

    pub fn reflow_cutoff(mut self, r: f32) -> Self {
        self.config.reflow_cutoff = r;
        self
    }

    pub fn repair_attempts(mut self, n: u32) -> Self {
        self.config.repair_attempts = n;
        self
    }

    /// Build the configuration, validating cross-field constraints.
    pub fn build(self) -> Result<PipelineConfig, PolydocError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(PolydocError::InvalidConfig("concurrency must be ≥ 1".into()));
        }
        if c.reflow_cutoff <= c.fit_tolerance {
            return Err(PolydocError::InvalidConfig(format!(
                "reflow_cutoff ({}) must exceed fit_tolerance ({})",
                c.reflow_cutoff, c.fit_tolerance
            )));
        }
        if c.detect_min_chars > c.detect_sample_chars {
            return Err(PolydocError::InvalidConfig(
                "detect_min_chars cannot exceed detect_sample_chars".into(),
            ));
        }
        Ok(self.config)
    }
}
