//! Pipeline stages for the document transformation run.
//!
//! Each submodule implements exactly one stage. Keeping stages separate
//! makes each independently testable and lets us swap implementations
//! (e.g. the PDF backend) without touching other stages.
//!
//! ## Data Flow
//!
//! ```text
//! layout ──▶ detect ──┬▶ extract ───▶ JSON
//! (pdfium)  (whatlang)├▶ translate ─▶ writer ─▶ PDF
//!                     └▶ summarize ─▶ writer ─▶ TXT/PDF
//! ```
//!
//! 1. [`layout`]    — read positioned text blocks per page; runs in
//!    `spawn_blocking` because pdfium is not async-safe
//! 2. [`detect`]    — offline language identification over a bounded sample
//! 3. [`extract`]   — schema-driven JSON extraction with one repair round
//! 4. [`translate`] — batched block translation, overflow directives, keyed
//!    reassembly; the hardest stage
//! 5. [`summarize`] — map-reduce summarisation
//! 6. [`writer`]    — emit new PDF page streams (layout-preserving or flowed)

pub mod detect;
pub mod extract;
pub mod layout;
pub mod summarize;
pub mod translate;
pub mod writer;
