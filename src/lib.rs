//! # polydoc
//!
//! An async PDF transformation pipeline: one document in, up to four
//! artifacts out.
//!
//! - a **language verdict** (offline, deterministic, always produced)
//! - **structured JSON** conforming to a caller-supplied schema
//! - a **layout-preserving translated PDF**
//! - a **summary** as plain text or PDF
//!
//! Text extraction runs locally through pdfium; everything model-shaped
//! goes through a single retrying completion gateway, so retry, timeout,
//! and rate-limit policy exist in exactly one place.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use polydoc::{
//!     CancelToken, LlmConfig, Pipeline, PipelineConfig, PipelineRequest,
//!     SummaryFormat,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), polydoc::PolydocError> {
//!     let pipeline = Pipeline::new(
//!         LlmConfig::new("api-key", "gemini-2.0-flash-lite"),
//!         PipelineConfig::default(),
//!     )?;
//!     let request = PipelineRequest::new()
//!         .translate("French")
//!         .summarize("English", SummaryFormat::Txt);
//!     let output = pipeline
//!         .process("contract.pdf", &request, &CancelToken::new())
//!         .await?;
//!     println!("language: {} ({:.2})", output.verdict.code, output.verdict.confidence);
//!     Ok(())
//! }
//! ```
//!
//! ## Partial failure
//!
//! A single failed translation block or summary chunk never fails the run:
//! it is recorded in the output struct and the artifact degrades visibly
//! (source text plus marker, or a summary missing one section). Only
//! total failure of an engine is an `Err`.

pub mod config;
pub mod document;
pub mod error;
pub mod gateway;
pub mod output;
pub mod pipeline;
pub mod process;
pub mod prompts;
pub mod schema;

pub use config::{LlmConfig, PipelineConfig, PipelineConfigBuilder};
pub use document::{
    BoundingBox, Document, LayoutDirective, Page, TextBlock, TranslatedBlock,
};
pub use error::{BlockFailure, ChunkFailure, PolydocError};
pub use gateway::{
    CancelToken, CompletionBackend, CompletionError, CompletionGateway, CompletionRequest,
    CompletionResponse, GeminiBackend,
};
pub use output::{
    DocumentInfo, ExtractionOutput, LanguageVerdict, PipelineOutput, RunStats, SummaryFormat,
    SummaryOutput, TranslationOutput, UNKNOWN_LANGUAGE,
};
pub use process::{
    write_atomic, ExtractionRequest, Pipeline, PipelineRequest, SummaryRequest,
    TranslationRequest,
};
pub use schema::{ExtractionSchema, FieldKind, FieldSpec};
