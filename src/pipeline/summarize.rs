//! Map-reduce summarisation.
//!
//! Short documents are summarised in one call. Longer ones are chunked
//! under the character budget, each chunk summarised concurrently (map),
//! and the per-chunk summaries combined in document order by one final
//! reduce call. A failed chunk is skipped with a recorded [`ChunkFailure`];
//! only all chunks failing is fatal. A failed *reduce* call degrades to the
//! concatenated chunk summaries — a rougher summary beats no summary.

use crate::config::PipelineConfig;
use crate::document::Page;
use crate::error::{ChunkFailure, PolydocError};
use crate::gateway::{CancelToken, CompletionGateway};
use crate::output::{SummaryFormat, SummaryOutput};
use crate::pipeline::extract::chunk_text;
use crate::pipeline::writer;
use crate::prompts::{compose, Task};
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

/// Summarise the document text into `target_language`.
pub async fn summarize(
    pages: &[Page],
    target_language: &str,
    instructions: &str,
    format: SummaryFormat,
    gateway: &CompletionGateway,
    config: &PipelineConfig,
    cancel: &CancelToken,
) -> Result<SummaryOutput, PolydocError> {
    let text: String = pages.iter().map(|p| p.text()).collect();
    let chunks = chunk_text(&text, config.chunk_char_budget);
    if chunks.is_empty() {
        return Err(PolydocError::SummaryFailed {
            chunks: 0,
            first_error: "document contains no extractable text".to_string(),
        });
    }
    let chunk_count = chunks.len();
    info!("summarising {chunk_count} chunks (target: {target_language})");

    // Map pass: one summary per chunk, concurrent, reassembled by index.
    let mut results: Vec<(usize, Result<String, String>)> =
        stream::iter(chunks.into_iter().enumerate().map(|(i, chunk)| {
            let gateway = gateway.clone();
            let cancel = cancel.clone();
            let config = config.clone();
            let target = target_language.to_string();
            let instructions = instructions.to_string();
            async move {
                if cancel.is_cancelled() {
                    return (i, Err("run cancelled before dispatch".to_string()));
                }
                let request = compose(
                    &Task::Summarize {
                        text: &chunk,
                        target_language: &target,
                    },
                    &instructions,
                    &config,
                );
                let outcome = gateway
                    .complete("summarize", &request)
                    .await
                    .map(|r| r.text.trim().to_string())
                    .map_err(|e| e.to_string());
                (i, outcome)
            }
        }))
        .buffer_unordered(config.concurrency)
        .collect()
        .await;
    results.sort_by_key(|(i, _)| *i);

    let mut chunk_summaries = Vec::new();
    let mut failed_chunks = Vec::new();
    for (i, outcome) in results {
        match outcome {
            Ok(summary) => chunk_summaries.push(summary),
            Err(detail) => failed_chunks.push(ChunkFailure { chunk: i, detail }),
        }
    }

    if chunk_summaries.is_empty() {
        let first_error = failed_chunks
            .first()
            .map(|f| f.detail.clone())
            .unwrap_or_default();
        return Err(PolydocError::SummaryFailed {
            chunks: chunk_count,
            first_error,
        });
    }
    if !failed_chunks.is_empty() {
        warn!(
            "{} of {chunk_count} summary chunks failed; reducing the rest",
            failed_chunks.len()
        );
    }

    let summary = if chunk_summaries.len() == 1 {
        chunk_summaries.into_iter().next().unwrap_or_default()
    } else {
        reduce(&chunk_summaries, target_language, instructions, gateway, config, cancel).await
    };

    let pdf = match format {
        SummaryFormat::Txt => None,
        SummaryFormat::Pdf => Some(writer::render_flowed(&summary)?),
    };

    Ok(SummaryOutput {
        text: summary,
        pdf,
        failed_chunks,
        chunks: chunk_count,
    })
}

/// Combine chunk summaries with one reduce call, degrading to plain
/// concatenation when the call fails or the run was cancelled.
async fn reduce(
    chunk_summaries: &[String],
    target_language: &str,
    instructions: &str,
    gateway: &CompletionGateway,
    config: &PipelineConfig,
    cancel: &CancelToken,
) -> String {
    if !cancel.is_cancelled() {
        let request = compose(
            &Task::ReduceSummaries {
                chunk_summaries,
                target_language,
            },
            instructions,
            config,
        );
        match gateway.complete("summarize", &request).await {
            Ok(response) => return response.text.trim().to_string(),
            Err(e) => warn!("reduce pass failed, joining chunk summaries: {e}"),
        }
    }
    chunk_summaries.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{BoundingBox, TextBlock};
    use crate::gateway::{
        CompletionBackend, CompletionError, CompletionRequest, CompletionResponse,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    fn page_with(index: usize, text: &str) -> Page {
        Page {
            index,
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
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<CompletionResponse, CompletionError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicU64::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<CompletionResponse, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(request.prompt.clone());
            self.script.lock().unwrap().remove(0)
        }
    }

    fn ok(text: &str) -> Result<CompletionResponse, CompletionError> {
        Ok(CompletionResponse { text: text.into() })
    }

    fn fail() -> Result<CompletionResponse, CompletionError> {
        Err(CompletionError::ContentRejected("scripted".into()))
    }

    fn config() -> PipelineConfig {
        PipelineConfig::default()
    }

    fn small_chunk_config() -> PipelineConfig {
        let mut cfg = config();
        cfg.chunk_char_budget = 1000;
        cfg.concurrency = 1; // scripted replies are positional
        cfg
    }

    #[tokio::test]
    async fn short_document_is_one_call_no_reduce() {
        let backend = Arc::new(ScriptedBackend::new(vec![ok("a short summary")]));
        let gw = CompletionGateway::new(backend.clone(), &config());
        let out = summarize(
            &[page_with(0, "brief text")],
            "English",
            "",
            SummaryFormat::Txt,
            &gw,
            &config(),
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.text, "a short summary");
        assert_eq!(out.chunks, 1);
        assert!(out.pdf.is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn long_document_maps_then_reduces_in_order() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ok("S1"),
            ok("S2"),
            ok("S3"),
            ok("combined"),
        ]));
        let gw = CompletionGateway::new(backend.clone(), &small_chunk_config());
        let pages: Vec<Page> = (0..3)
            .map(|i| page_with(i, &format!("section {i} {}", "text ".repeat(180))))
            .collect();
        let out = summarize(
            &pages,
            "English",
            "",
            SummaryFormat::Txt,
            &gw,
            &small_chunk_config(),
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.text, "combined");
        assert_eq!(out.chunks, 3);
        // Reduce prompt carries the chunk summaries in document order.
        let prompts = backend.prompts.lock().unwrap();
        let reduce_prompt = prompts.last().unwrap();
        assert!(reduce_prompt.contains("S1 S2 S3"));
    }

    #[tokio::test]
    async fn failed_chunk_is_skipped_not_fatal() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ok("S1"),
            fail(),
            ok("S3"),
            ok("combined without S2"),
        ]));
        let cfg = small_chunk_config();
        let gw = CompletionGateway::new(backend, &cfg);
        let pages: Vec<Page> = (0..3)
            .map(|i| page_with(i, &format!("section {i} {}", "text ".repeat(180))))
            .collect();
        let out = summarize(
            &pages,
            "English",
            "",
            SummaryFormat::Txt,
            &gw,
            &cfg,
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.failed_chunks.len(), 1);
        assert_eq!(out.failed_chunks[0].chunk, 1);
        assert_eq!(out.text, "combined without S2");
    }

    #[tokio::test]
    async fn all_chunks_failing_is_fatal() {
        let backend = Arc::new(ScriptedBackend::new(vec![fail()]));
        let gw = CompletionGateway::new(backend, &config());
        let err = summarize(
            &[page_with(0, "text")],
            "English",
            "",
            SummaryFormat::Txt,
            &gw,
            &config(),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PolydocError::SummaryFailed { chunks: 1, .. }));
    }

    #[tokio::test]
    async fn reduce_failure_degrades_to_joined_summaries() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ok("S1"),
            ok("S2"),
            fail(), // the reduce call
        ]));
        let cfg = small_chunk_config();
        let gw = CompletionGateway::new(backend, &cfg);
        let pages: Vec<Page> = (0..2)
            .map(|i| page_with(i, &format!("section {i} {}", "text ".repeat(180))))
            .collect();
        let out = summarize(
            &pages,
            "English",
            "",
            SummaryFormat::Txt,
            &gw,
            &cfg,
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.text, "S1\n\nS2");
    }

    #[tokio::test]
    async fn pdf_format_renders_the_summary() {
        let backend = Arc::new(ScriptedBackend::new(vec![ok("summary body")]));
        let gw = CompletionGateway::new(backend, &config());
        let out = summarize(
            &[page_with(0, "text")],
            "English",
            "",
            SummaryFormat::Pdf,
            &gw,
            &config(),
            &CancelToken::new(),
        )
        .await
        .unwrap();
        let pdf = out.pdf.expect("pdf bytes requested");
        assert!(lopdf::Document::load_mem(&pdf).is_ok());
    }

    #[tokio::test]
    async fn empty_document_cannot_be_summarised() {
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let gw = CompletionGateway::new(backend.clone(), &config());
        let err = summarize(
            &[],
            "English",
            "",
            SummaryFormat::Txt,
            &gw,
            &config(),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PolydocError::SummaryFailed { chunks: 0, .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }
}
