//! Output types returned by a pipeline run.
//!
//! One [`PipelineOutput`] per document: the language verdict is always
//! present, the per-engine artifacts only when the caller selected them.
//! Partial failures (untranslated blocks, failed summary chunks) live inside
//! the artifact structs — they never escalate to a run-level error.

use crate::error::{BlockFailure, ChunkFailure};
use serde::{Deserialize, Serialize};

/// ISO 639-3 sentinel for "undetermined language".
pub const UNKNOWN_LANGUAGE: &str = "und";

/// The detector's verdict for one document.
///
/// Invariant: `confidence` is in [0,1] and is 0 exactly when detection was
/// impossible (empty or too-short input), in which case `code` is
/// [`UNKNOWN_LANGUAGE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageVerdict {
    /// ISO 639-3 language code, or [`UNKNOWN_LANGUAGE`].
    pub code: String,
    /// Human-readable language name when known.
    pub name: Option<String>,
    /// Detection confidence in [0,1].
    pub confidence: f64,
}

impl LanguageVerdict {
    /// The defined verdict for input too short (or empty) to classify.
    pub fn unknown() -> Self {
        Self {
            code: UNKNOWN_LANGUAGE.to_string(),
            name: None,
            confidence: 0.0,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.code == UNKNOWN_LANGUAGE
    }
}

/// Document facts available without any model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub filename: String,
    pub page_count: usize,
    /// Total text blocks across all pages.
    pub block_count: usize,
    /// Total extractable characters.
    pub text_chars: usize,
}

/// Structured-extraction artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    /// JSON conforming to the caller's schema.
    pub json: serde_json::Value,
    /// True when the one-shot repair round-trip was needed.
    pub repaired: bool,
    /// How many text chunks were extracted and merged.
    pub chunks: usize,
}

/// Layout-preserving translation artifact.
#[derive(Debug, Clone)]
pub struct TranslationOutput {
    /// The rendered PDF.
    pub pdf: Vec<u8>,
    /// Blocks left untranslated (rendered in the source language with a
    /// marker). Empty on full success.
    pub failed_blocks: Vec<BlockFailure>,
    /// Blocks whose full text was moved to trailing appendix pages.
    pub appendix_blocks: usize,
    /// Number of gateway batches dispatched.
    pub batches: usize,
}

/// Requested summary artifact format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryFormat {
    #[default]
    Txt,
    Pdf,
}

/// Summarisation artifact.
#[derive(Debug, Clone)]
pub struct SummaryOutput {
    /// The summary text (always present, even for PDF output).
    pub text: String,
    /// Rendered PDF bytes when [`SummaryFormat::Pdf`] was requested.
    pub pdf: Option<Vec<u8>>,
    /// Chunks whose map-pass summary failed. Empty on full success.
    pub failed_chunks: Vec<ChunkFailure>,
    /// How many map-pass chunks the document was split into.
    pub chunks: usize,
}

/// Wall-clock and gateway accounting for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub read_duration_ms: u64,
    pub detect_duration_ms: u64,
    pub extract_duration_ms: u64,
    pub translate_duration_ms: u64,
    pub summarize_duration_ms: u64,
    pub total_duration_ms: u64,
    /// Completion calls issued (including retries).
    pub gateway_calls: u64,
    /// Retry attempts among those calls.
    pub gateway_retries: u64,
}

/// Everything one pipeline run produced.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Exactly one verdict per document.
    pub verdict: LanguageVerdict,
    pub document: DocumentInfo,
    pub extraction: Option<ExtractionOutput>,
    pub translation: Option<TranslationOutput>,
    pub summary: Option<SummaryOutput>,
    pub stats: RunStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_verdict_has_zero_confidence_and_sentinel_code() {
        let v = LanguageVerdict::unknown();
        assert_eq!(v.code, UNKNOWN_LANGUAGE);
        assert_eq!(v.confidence, 0.0);
        assert!(v.is_unknown());
    }

    #[test]
    fn summary_format_serde_names() {
        assert_eq!(
            serde_json::to_string(&SummaryFormat::Pdf).unwrap(),
            "\"pdf\""
        );
        let f: SummaryFormat = serde_json::from_str("\"txt\"").unwrap();
        assert_eq!(f, SummaryFormat::Txt);
    }
}
