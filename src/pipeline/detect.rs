//! Language detection over extracted text.
//!
//! Deliberately NOT a model call: whatlang's trigram classifier is
//! deterministic, offline, and fast, which keeps the verdict free and
//! reproducible even when the completion service is down. Only a bounded
//! prefix of the document is sampled — statistics converge long before the
//! sample budget on any real document, so reading megabytes buys nothing.

use crate::config::PipelineConfig;
use crate::output::LanguageVerdict;
use tracing::debug;

/// Detect the document language from a text sample.
///
/// Inputs shorter than `config.detect_min_chars` (after trimming) yield the
/// defined unknown verdict rather than a guess; everything longer yields a
/// verdict with confidence strictly above 0. Identical input always produces
/// an identical verdict.
pub fn detect(text: &str, config: &PipelineConfig) -> LanguageVerdict {
    let sample: String = text.chars().take(config.detect_sample_chars).collect();
    let sample = sample.trim();

    if sample.chars().count() < config.detect_min_chars {
        debug!(
            "sample too short for detection ({} chars, minimum {})",
            sample.chars().count(),
            config.detect_min_chars
        );
        return LanguageVerdict::unknown();
    }

    match whatlang::detect(sample) {
        Some(info) => {
            // The zero-confidence value is reserved for "detection
            // impossible"; a classified sample is never reported as 0.
            let confidence = info.confidence().max(0.01);
            debug!(
                "detected {} with confidence {:.2}",
                info.lang().code(),
                confidence
            );
            LanguageVerdict {
                code: info.lang().code().to_string(),
                name: Some(info.lang().eng_name().to_string()),
                confidence,
            }
        }
        None => LanguageVerdict::unknown(),
    }
}
