//! Schema-driven structured extraction.
//!
//! The document text is chunked under a character budget, each chunk is
//! extracted independently through the gateway, and the partial JSON objects
//! are merged in document order (arrays concatenate, scalars keep the first
//! non-null value). A chunk whose output does not conform to the schema gets
//! one bounded repair round-trip — the model is shown its own output and the
//! exact violations; if the repaired output still fails, the whole
//! extraction fails with the violations attached. Unbounded repair loops are
//! a cost hazard, which is why the attempt budget is configuration, not a
//! loop condition.

use crate::config::PipelineConfig;
use crate::document::Page;
use crate::error::PolydocError;
use crate::gateway::{CancelToken, CompletionGateway};
use crate::output::ExtractionOutput;
use crate::prompts::{compose, Task};
use crate::schema::{merge_partials, ExtractionSchema};
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

/// Models frequently wrap JSON in a markdown fence despite instructions.
static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").unwrap());

/// Extract `schema`-shaped JSON from the document text.
///
/// All-or-nothing: unlike translation, a partially extracted document is
/// not a useful artifact, so any chunk failing conformance (after its
/// repair budget) fails the extraction.
pub async fn extract(
    pages: &[Page],
    schema: &ExtractionSchema,
    instructions: &str,
    gateway: &CompletionGateway,
    config: &PipelineConfig,
    cancel: &CancelToken,
) -> Result<ExtractionOutput, PolydocError> {
    let text: String = pages.iter().map(|p| p.text()).collect();
    let chunks = chunk_text(&text, config.chunk_char_budget);
    let chunk_count = chunks.len().max(1);
    info!("extracting over {chunk_count} chunks");

    if chunks.is_empty() {
        // No text at all: every field is honestly null.
        let empty = serde_json::json!({});
        let violations = schema.validate(&empty);
        let json = merge_partials(schema, vec![empty]);
        if !violations.is_empty() {
            // Required fields cannot be satisfied by a scanned document.
            return Err(PolydocError::SchemaConformanceFailure {
                attempts: 0,
                violations,
                last_output: "{}".to_string(),
            });
        }
        return Ok(ExtractionOutput {
            json,
            repaired: false,
            chunks: 0,
        });
    }

    let results: Vec<(usize, Result<(serde_json::Value, bool), PolydocError>)> =
        stream::iter(chunks.into_iter().enumerate().map(|(i, chunk)| {
            let gateway = gateway.clone();
            let cancel = cancel.clone();
            let config = config.clone();
            let schema = schema.clone();
            let instructions = instructions.to_string();
            async move {
                let result =
                    extract_chunk(&chunk, &schema, &instructions, &gateway, &config, &cancel)
                        .await;
                (i, result)
            }
        }))
        .buffer_unordered(config.concurrency)
        .collect()
        .await;

    // Merge in document order, not arrival order.
    let mut ordered = results;
    ordered.sort_by_key(|(i, _)| *i);

    let mut partials = Vec::with_capacity(ordered.len());
    let mut repaired = false;
    for (i, result) in ordered {
        match result {
            Ok((value, chunk_repaired)) => {
                debug!("chunk {i}: extracted ok (repaired: {chunk_repaired})");
                partials.push(value);
                repaired |= chunk_repaired;
            }
            Err(e) => return Err(e),
        }
    }

    let json = merge_partials(schema, partials);
    let violations = schema.validate(&json);
    if !violations.is_empty() {
        // Per-chunk outputs conformed but the merge lost required fields
        // (e.g. a field no chunk contained). Report it as conformance.
        warn!("merged extraction violates schema: {violations:?}");
        let last_output = json.to_string();
        return Err(PolydocError::SchemaConformanceFailure {
            attempts: config.repair_attempts,
            violations,
            last_output,
        });
    }

    Ok(ExtractionOutput {
        json,
        repaired,
        chunks: chunk_count,
    })
}

/// Extract one chunk, with up to `repair_attempts` correction round-trips.
/// Returns the conforming value and whether repair was needed.
async fn extract_chunk(
    chunk: &str,
    schema: &ExtractionSchema,
    instructions: &str,
    gateway: &CompletionGateway,
    config: &PipelineConfig,
    cancel: &CancelToken,
) -> Result<(serde_json::Value, bool), PolydocError> {
    if cancel.is_cancelled() {
        return Err(PolydocError::Internal(
            "run cancelled before extraction".to_string(),
        ));
    }

    let request = compose(
        &Task::Extract {
            schema,
            text: chunk,
        },
        instructions,
        config,
    );
    let reply = gateway
        .complete("extract", &request)
        .await
        .map_err(|e| e.into_fatal("extract", gateway.max_retries()))?;

    let mut last_output = reply.text;
    let mut last_violations = match conform(&last_output, schema) {
        Ok(value) => return Ok((value, false)),
        Err(violations) => violations,
    };

    for attempt in 1..=config.repair_attempts {
        if cancel.is_cancelled() {
            break;
        }
        debug!(
            "extraction repair attempt {attempt}: {} violations",
            last_violations.len()
        );
        let request = compose(
            &Task::RepairExtraction {
                schema,
                violations: &last_violations,
                previous_output: &last_output,
            },
            instructions,
            config,
        );
        let reply = gateway
            .complete("extract", &request)
            .await
            .map_err(|e| e.into_fatal("extract", gateway.max_retries()))?;
        last_output = reply.text;
        match conform(&last_output, schema) {
            Ok(value) => return Ok((value, true)),
            Err(violations) => last_violations = violations,
        }
    }

    Err(PolydocError::SchemaConformanceFailure {
        attempts: config.repair_attempts,
        violations: last_violations,
        last_output,
    })
}

/// Parse a model reply and validate it against the schema. A parse failure
/// is reported as a violation so the repair prompt can describe it.
fn conform(reply: &str, schema: &ExtractionSchema) -> Result<serde_json::Value, Vec<String>> {
    let body = strip_fences(reply);
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| vec![format!("output was not valid JSON: {e}")])?;
    let violations = schema.validate(&value);
    if violations.is_empty() {
        Ok(value)
    } else {
        Err(violations)
    }
}

fn strip_fences(reply: &str) -> &str {
    match FENCE_RE.captures(reply) {
        Some(c) => c.get(1).map_or(reply, |m| m.as_str()),
        None => reply.trim(),
    }
}

/// Split text into chunks under `budget` characters, preferring line
/// boundaries. An oversized single line is hard-split. Shared with the
/// summariser, which chunks under the same budget.
pub(crate) fn chunk_text(text: &str, budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    let push_current = |current: &mut String, current_chars: &mut usize, chunks: &mut Vec<String>| {
        if !current.trim().is_empty() {
            chunks.push(std::mem::take(current));
        } else {
            current.clear();
        }
        *current_chars = 0;
    };

    for line in text.split('\n') {
        let line_chars = line.chars().count();
        if current_chars > 0 && current_chars + line_chars + 1 > budget {
            push_current(&mut current, &mut current_chars, &mut chunks);
        }
        if line_chars > budget {
            // Hard-split an oversized line at the budget boundary.
            let mut rest: Vec<char> = line.chars().collect();
            while rest.len() > budget {
                push_current(&mut current, &mut current_chars, &mut chunks);
                chunks.push(rest.drain(..budget).collect());
            }
            current = rest.into_iter().collect();
            current_chars = current.chars().count();
        } else {
            if current_chars > 0 {
                current.push('\n');
                current_chars += 1;
            }
            current.push_str(line);
            current_chars += line_chars;
        }
    }
    push_current(&mut current, &mut current_chars, &mut chunks);
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{BoundingBox, TextBlock};
    use crate::gateway::{
        CompletionBackend, CompletionError, CompletionRequest, CompletionResponse,
    };
    use crate::schema::{FieldKind, FieldSpec};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    fn schema() -> ExtractionSchema {
        ExtractionSchema::new()
            .field("vendor", FieldSpec::new(FieldKind::String))
            .field("total", FieldSpec::new(FieldKind::Float).optional())
    }

    fn page_with(text: &str) -> Page {
        Page {
            index: 0,
            width: 595.0,
            height: 842.0,
            blocks: vec![TextBlock {
                index: 0,
                text: text.to_string(),
                bbox: BoundingBox {
                    x: 50.0,
                    y: 700.0,
                    width: 300.0,
                    height: 13.0,
                },
                font_family: None,
                font_size: 11.0,
                line_count: 1,
            }],
        }
    }

    struct ScriptedBackend {
        script: Mutex<Vec<Result<CompletionResponse, CompletionError>>>,
        calls: AtomicU64,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                script: Mutex::new(
                    replies
                        .into_iter()
                        .map(|t| Ok(CompletionResponse { text: t.to_string() }))
                        .collect(),
                ),
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

    fn gateway(backend: Arc<dyn CompletionBackend>) -> CompletionGateway {
        CompletionGateway::new(backend, &PipelineConfig::default())
    }

    #[test]
    fn fences_are_stripped_before_parsing() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn chunking_prefers_line_boundaries() {
        let text = "aaaa\nbbbb\ncccc\ndddd";
        let chunks = chunk_text(text, 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb", "cccc\ndddd"]);
    }

    #[test]
    fn oversized_lines_are_hard_split() {
        let text = "x".repeat(25);
        let chunks = chunk_text(&text, 10);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        let total: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert_eq!(total, 25);
    }

    #[tokio::test]
    async fn conforming_output_passes_without_repair() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            r#"{"vendor": "ACME", "total": 99.5}"#,
        ]));
        let gw = gateway(backend.clone());
        let out = extract(
            &[page_with("Invoice from ACME, total 99.50")],
            &schema(),
            "",
            &gw,
            &PipelineConfig::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.json, json!({"vendor": "ACME", "total": 99.5}));
        assert!(!out.repaired);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_conforming_output_gets_one_repair_round_trip() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            r#"{"vendor": 42}"#,
            r#"{"vendor": "ACME"}"#,
        ]));
        let gw = gateway(backend.clone());
        let out = extract(
            &[page_with("Invoice from ACME")],
            &schema(),
            "",
            &gw,
            &PipelineConfig::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.json["vendor"], "ACME");
        assert!(out.repaired);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn repair_failure_surfaces_violations_and_last_output() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            r#"{"vendor": 42}"#,
            r#"{"vendor": false}"#,
        ]));
        let gw = gateway(backend.clone());
        let err = extract(
            &[page_with("Invoice")],
            &schema(),
            "",
            &gw,
            &PipelineConfig::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            PolydocError::SchemaConformanceFailure {
                attempts,
                violations,
                last_output,
            } => {
                assert_eq!(attempts, 1);
                assert!(!violations.is_empty());
                assert!(last_output.contains("false"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Initial call plus exactly one repair.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unparseable_output_is_treated_as_a_violation() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            "this is not JSON at all",
            r#"{"vendor": "ACME"}"#,
        ]));
        let gw = gateway(backend);
        let out = extract(
            &[page_with("Invoice")],
            &schema(),
            "",
            &gw,
            &PipelineConfig::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert!(out.repaired);
    }

    #[tokio::test]
    async fn multi_chunk_results_merge_in_document_order() {
        let list_schema = ExtractionSchema::new().field(
            "items",
            FieldSpec::new(FieldKind::List {
                item: Box::new(FieldKind::String),
            }),
        );
        let backend = Arc::new(ScriptedBackend::new(vec![
            r#"{"items": ["a"]}"#,
            r#"{"items": ["b"]}"#,
        ]));
        let mut cfg = PipelineConfig::default();
        cfg.chunk_char_budget = 1000;
        cfg.concurrency = 1; // scripted replies are positional
        let gw = gateway(backend);
        let long_a = "first section ".repeat(40);
        let long_b = "second section ".repeat(40);
        let pages = vec![page_with(&long_a), {
            let mut p = page_with(&long_b);
            p.index = 1;
            p
        }];
        let out = extract(&pages, &list_schema, "", &gw, &cfg, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(out.json, json!({"items": ["a", "b"]}));
        assert_eq!(out.chunks, 2);
    }

    #[tokio::test]
    async fn empty_document_with_required_fields_fails_conformance() {
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let gw = gateway(backend.clone());
        let err = extract(
            &[],
            &schema(),
            "",
            &gw,
            &PipelineConfig::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PolydocError::SchemaConformanceFailure { .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }
}
