//! Top-level pipeline entry points.
//!
//! A [`Pipeline`] owns one gateway and one configuration and serves any
//! number of runs. Each run takes a [`PipelineRequest`] naming the wanted
//! artifacts; the language verdict is computed unconditionally because it
//! is free (no model call) and every caller wants it.
//!
//! Engines run sequentially within one run — each engine already saturates
//! the configured gateway concurrency on its own, so overlapping engines
//! would only trade per-stage timing visibility for rate-limit pressure.

use crate::config::{LlmConfig, PipelineConfig};
use crate::document::{Document, Page};
use crate::error::PolydocError;
use crate::gateway::{CancelToken, CompletionBackend, CompletionGateway, GeminiBackend};
use crate::output::{
    DocumentInfo, LanguageVerdict, PipelineOutput, RunStats, SummaryFormat,
};
use crate::pipeline::{detect, extract, layout, summarize, translate};
use crate::schema::ExtractionSchema;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// What one run should produce, beyond the always-on language verdict.
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    pub extraction: Option<ExtractionRequest>,
    pub translation: Option<TranslationRequest>,
    pub summary: Option<SummaryRequest>,
    /// Caller guidance forwarded into every prompt; may use the
    /// `{target_language}` placeholder. Empty means default templates only.
    pub instructions: String,
}

#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub schema: ExtractionSchema,
}

#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub target_language: String,
}

#[derive(Debug, Clone)]
pub struct SummaryRequest {
    pub target_language: String,
    pub format: SummaryFormat,
}

impl PipelineRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extract(mut self, schema: ExtractionSchema) -> Self {
        self.extraction = Some(ExtractionRequest { schema });
        self
    }

    pub fn translate(mut self, target_language: impl Into<String>) -> Self {
        self.translation = Some(TranslationRequest {
            target_language: target_language.into(),
        });
        self
    }

    pub fn summarize(
        mut self,
        target_language: impl Into<String>,
        format: SummaryFormat,
    ) -> Self {
        self.summary = Some(SummaryRequest {
            target_language: target_language.into(),
            format,
        });
        self
    }

    pub fn instructions(mut self, text: impl Into<String>) -> Self {
        self.instructions = text.into();
        self
    }
}

/// A configured pipeline: gateway plus run policy, reusable across runs.
#[derive(Clone)]
pub struct Pipeline {
    gateway: CompletionGateway,
    config: PipelineConfig,
}

impl Pipeline {
    /// Production pipeline against the Gemini completion service.
    pub fn new(llm: LlmConfig, config: PipelineConfig) -> Result<Self, PolydocError> {
        let backend = Arc::new(GeminiBackend::new(llm)?);
        Ok(Self::with_backend(backend, config))
    }

    /// Pipeline over an arbitrary backend; used by tests and by callers
    /// bringing their own completion service.
    pub fn with_backend(backend: Arc<dyn CompletionBackend>, config: PipelineConfig) -> Self {
        Self {
            gateway: CompletionGateway::new(backend, &config),
            config,
        }
    }

    /// Run the pipeline over a PDF file on disk.
    pub async fn process(
        &self,
        path: impl AsRef<Path>,
        request: &PipelineRequest,
        cancel: &CancelToken,
    ) -> Result<PipelineOutput, PolydocError> {
        let path = path.as_ref();
        check_magic(path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.run(path, &filename, request, cancel).await
    }

    /// Run the pipeline over in-memory PDF bytes (uploads).
    pub async fn process_bytes(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        request: &PipelineRequest,
        cancel: &CancelToken,
    ) -> Result<PipelineOutput, PolydocError> {
        self.process_document(Document::new(bytes, filename), request, cancel)
            .await
    }

    /// Run the pipeline over an in-memory [`Document`].
    ///
    /// The bytes are staged in a temporary file because the PDF backend
    /// reads from a path; the file is removed when the run completes.
    pub async fn process_document(
        &self,
        document: Document,
        request: &PipelineRequest,
        cancel: &CancelToken,
    ) -> Result<PipelineOutput, PolydocError> {
        check_magic_bytes(&document.bytes, Path::new(&document.filename))?;
        let staged = stage_bytes(&document.bytes, &document.filename)?;
        self.run(staged.path(), &document.filename, request, cancel)
            .await
    }

    /// Document facts and language verdict only — no model calls, no cost.
    pub async fn inspect(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<(DocumentInfo, LanguageVerdict), PolydocError> {
        let path = path.as_ref();
        check_magic(path)?;
        let pages = layout::read_pages(path, &self.config).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let info = document_info(&filename, &pages);
        let verdict = detect::detect(&full_text(&pages), &self.config);
        Ok((info, verdict))
    }

    async fn run(
        &self,
        path: &Path,
        filename: &str,
        request: &PipelineRequest,
        cancel: &CancelToken,
    ) -> Result<PipelineOutput, PolydocError> {
        let run_start = Instant::now();
        let calls_before = self.gateway.metrics().calls();
        let retries_before = self.gateway.metrics().retries();
        let mut stats = RunStats::default();

        let read_start = Instant::now();
        let pages = layout::read_pages(path, &self.config).await?;
        stats.read_duration_ms = read_start.elapsed().as_millis() as u64;

        let document = document_info(filename, &pages);
        info!(
            "{filename}: {} pages, {} blocks, {} chars",
            document.page_count, document.block_count, document.text_chars
        );

        let detect_start = Instant::now();
        let text = full_text(&pages);
        let verdict = detect::detect(&text, &self.config);
        stats.detect_duration_ms = detect_start.elapsed().as_millis() as u64;

        let extraction = match &request.extraction {
            Some(req) => {
                let start = Instant::now();
                let out = extract::extract(
                    &pages,
                    &req.schema,
                    &request.instructions,
                    &self.gateway,
                    &self.config,
                    cancel,
                )
                .await?;
                stats.extract_duration_ms = start.elapsed().as_millis() as u64;
                Some(out)
            }
            None => None,
        };

        let translation = match &request.translation {
            Some(req) => {
                let start = Instant::now();
                let out = translate::translate(
                    &pages,
                    &req.target_language,
                    &request.instructions,
                    &self.gateway,
                    &self.config,
                    cancel,
                )
                .await?;
                stats.translate_duration_ms = start.elapsed().as_millis() as u64;
                Some(out)
            }
            None => None,
        };

        let summary = match &request.summary {
            Some(req) => {
                let start = Instant::now();
                let out = summarize::summarize(
                    &pages,
                    &req.target_language,
                    &request.instructions,
                    req.format,
                    &self.gateway,
                    &self.config,
                    cancel,
                )
                .await?;
                stats.summarize_duration_ms = start.elapsed().as_millis() as u64;
                Some(out)
            }
            None => None,
        };

        stats.total_duration_ms = run_start.elapsed().as_millis() as u64;
        stats.gateway_calls = self.gateway.metrics().calls() - calls_before;
        stats.gateway_retries = self.gateway.metrics().retries() - retries_before;

        Ok(PipelineOutput {
            verdict,
            document,
            extraction,
            translation,
            summary,
            stats,
        })
    }
}

fn full_text(pages: &[Page]) -> String {
    pages.iter().map(|p| p.text()).collect()
}

fn document_info(filename: &str, pages: &[Page]) -> DocumentInfo {
    DocumentInfo {
        filename: filename.to_string(),
        page_count: pages.len(),
        block_count: pages.iter().map(|p| p.blocks.len()).sum(),
        text_chars: pages.iter().map(|p| p.text().chars().count()).sum(),
    }
}

/// Reject non-PDF input before handing anything to the PDF backend, with
/// precise errors for the common filesystem failures.
fn check_magic(path: &Path) -> Result<(), PolydocError> {
    let mut file = std::fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PolydocError::FileNotFound {
            path: path.to_path_buf(),
        },
        std::io::ErrorKind::PermissionDenied => PolydocError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => PolydocError::UnreadablePdf {
            path: path.to_path_buf(),
            detail: e.to_string(),
        },
    })?;
    let mut magic = [0u8; 4];
    let n = file.read(&mut magic).map_err(|e| PolydocError::UnreadablePdf {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    if n < 4 || &magic != PDF_MAGIC {
        return Err(PolydocError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }
    Ok(())
}

fn check_magic_bytes(bytes: &[u8], path: &Path) -> Result<(), PolydocError> {
    let mut magic = [0u8; 4];
    let len = bytes.len().min(4);
    magic[..len].copy_from_slice(&bytes[..len]);
    if len < 4 || &magic != PDF_MAGIC {
        return Err(PolydocError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }
    Ok(())
}

fn stage_bytes(bytes: &[u8], filename: &str) -> Result<tempfile::NamedTempFile, PolydocError> {
    use std::io::Write;
    let mut staged = tempfile::NamedTempFile::new().map_err(|e| PolydocError::OutputWriteFailed {
        path: PathBuf::from(filename),
        source: e,
    })?;
    staged
        .write_all(bytes)
        .map_err(|e| PolydocError::OutputWriteFailed {
            path: staged.path().to_path_buf(),
            source: e,
        })?;
    staged.flush().map_err(|e| PolydocError::OutputWriteFailed {
        path: staged.path().to_path_buf(),
        source: e,
    })?;
    Ok(staged)
}

/// Write an artifact atomically: stage in the target directory, then rename
/// over the destination. A crashed run never leaves a half-written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PolydocError> {
    use std::io::Write;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut staged = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir),
        None => tempfile::NamedTempFile::new(),
    }
    .map_err(|e| PolydocError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    })?;
    staged
        .write_all(bytes)
        .map_err(|e| PolydocError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
    staged
        .persist(path)
        .map_err(|e| PolydocError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e.error,
        })?;
    Ok(())
}
