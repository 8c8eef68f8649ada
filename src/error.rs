//! Error types for the polydoc library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PolydocError`] — **Fatal**: the pipeline run cannot proceed at all
//!   (unreadable PDF, wrong password, gateway exhausted on every batch).
//!   Returned as `Err(PolydocError)` from the top-level `process*` functions.
//!
//! * [`BlockFailure`] / [`ChunkFailure`] — **Non-fatal**: a single translation
//!   block or summary chunk failed but everything else is fine. Stored inside
//!   [`crate::output::TranslationOutput`] / [`crate::output::SummaryOutput`]
//!   so callers can inspect partial success rather than losing the whole
//!   document to one bad model call.
//!
//! The separation lets callers decide their own tolerance: abort on the first
//! degraded block, log and continue, or collect everything for a post-run
//! report.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the polydoc library.
///
/// Block- and chunk-level failures use [`BlockFailure`] / [`ChunkFailure`]
/// and are stored in the respective output structs rather than propagated
/// here.
#[derive(Debug, Error)]
pub enum PolydocError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("Unreadable PDF '{path}': {detail}")]
    UnreadablePdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    // ── Gateway errors (after internal retry budget is exhausted) ─────────
    /// A completion call exceeded the response-size/timeout ceiling.
    #[error("Completion call timed out after {elapsed_ms}ms (task: {task})")]
    CompletionTimeout { task: String, elapsed_ms: u64 },

    /// The model service kept rate-limiting us past the retry budget.
    #[error("Rate limited by the model service after {retries} retries (task: {task})")]
    RateLimited { task: String, retries: u32 },

    /// The model service stayed unavailable past the retry budget.
    #[error("Model service unavailable after {retries} retries (task: {task}): {detail}")]
    ServiceUnavailable {
        task: String,
        retries: u32,
        detail: String,
    },

    /// The model service rejected the request as malformed. Never retried.
    #[error("Model service rejected the request (task: {task}): {detail}")]
    InvalidRequest { task: String, detail: String },

    /// The model service refused the content. Never retried.
    #[error("Content rejected by the model service (task: {task}): {detail}")]
    ContentRejected { task: String, detail: String },

    // ── Engine errors ─────────────────────────────────────────────────────
    /// Extraction output still violates the schema after the repair
    /// round-trip. Carries the last raw model output for caller diagnosis.
    #[error("Extraction result does not conform to the schema after {attempts} attempt(s): {violations:?}")]
    SchemaConformanceFailure {
        attempts: u32,
        violations: Vec<String>,
        last_output: String,
    },

    /// Every translation batch failed; no translated output exists.
    #[error("Untranslatable document: all {batches} translation batches failed.\nFirst error: {first_error}")]
    UntranslatableDocument { batches: usize, first_error: String },

    /// Every summary chunk failed; no summary exists.
    #[error("Summarisation failed for all {chunks} chunks.\nFirst error: {first_error}")]
    SummaryFailed { chunks: usize, first_error: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output artifact.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// PDF page assembly failed inside the writer.
    #[error("Failed to assemble output PDF: {0}")]
    PdfWriteFailed(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy."
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal failure for a single translation block.
///
/// The block is rendered with its original text plus a visible marker; the
/// run as a whole still succeeds unless ALL batches fail.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
#[error("block {block} on page {page}: {detail}")]
pub struct BlockFailure {
    /// 0-indexed page the block belongs to.
    pub page: usize,
    /// 0-indexed block position within the page.
    pub block: usize,
    /// Human-readable cause (usually the exhausted gateway error).
    pub detail: String,
}

/// A non-fatal failure for a single summary chunk.
///
/// The chunk is skipped in the reduce pass; remaining chunks still produce a
/// best-effort summary.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
#[error("summary chunk {chunk}: {detail}")]
pub struct ChunkFailure {
    /// 0-indexed chunk position in document order.
    pub chunk: usize,
    pub detail: String,
}
