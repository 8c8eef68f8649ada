//! Layout-preserving translation engine.
//!
//! Blocks are batched under a character budget, dispatched concurrently
//! through the gateway, and reassembled strictly by their `(page, block)`
//! key — batch completion order never influences output order. A failed
//! batch degrades to per-block failures (source text plus a visible marker
//! in the rendered PDF); the run only aborts when *every* batch failed,
//! which means the service itself is down.
//!
//! ## Placement policy
//!
//! Translations rarely occupy the same area as their source. The measured
//! area ratio (estimated rendered height over source box height, at the
//! source box width) picks one of four directives:
//!
//! - ratio ≤ `fit_tolerance` → place as-is
//! - ratio ≤ `reflow_cutoff` → shrink the font, floored at
//!   `font_scale_floor`
//! - above the cutoff → reflow into free page space below the block, or
//!   move the full text to a trailing appendix page when no room is left

use crate::config::PipelineConfig;
use crate::document::{LayoutDirective, Page, TextBlock, TranslatedBlock};
use crate::error::{BlockFailure, PolydocError};
use crate::gateway::{CancelToken, CompletionGateway};
use crate::output::TranslationOutput;
use crate::pipeline::writer;
use crate::prompts::{compose, Task};
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Blocks may not reflow below this page margin, in points.
const BOTTOM_MARGIN: f32 = 20.0;

static MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*@@BLOCK\s+(\d+)@@\s*$").unwrap());

/// One block queued for translation, keyed by `(page, block)`.
#[derive(Debug, Clone)]
struct WorkItem {
    page: usize,
    block: usize,
    text: String,
}

/// One gateway call's worth of blocks.
#[derive(Debug, Clone)]
struct Batch {
    id: usize,
    items: Vec<WorkItem>,
}

/// Translate every text block of `pages` into `target_language` and render
/// the layout-preserving PDF.
///
/// Returns [`PolydocError::UntranslatableDocument`] only when all batches
/// failed; any partial success produces a PDF with failed blocks rendered in
/// the source language.
pub async fn translate(
    pages: &[Page],
    target_language: &str,
    instructions: &str,
    gateway: &CompletionGateway,
    config: &PipelineConfig,
    cancel: &CancelToken,
) -> Result<TranslationOutput, PolydocError> {
    let batches = form_batches(pages, config.batch_char_budget);
    let batch_count = batches.len();
    if batch_count == 0 {
        // A document of scanned pages still gets its (blank) PDF back.
        let pdf = writer::render_translated(pages, &[])?;
        return Ok(TranslationOutput {
            pdf,
            failed_blocks: Vec::new(),
            appendix_blocks: 0,
            batches: 0,
        });
    }
    info!(
        "translating {} blocks in {} batches (target: {target_language})",
        batches.iter().map(|b| b.items.len()).sum::<usize>(),
        batch_count
    );

    // Fan out, collect unordered, reassemble by key below.
    let outcomes: Vec<(usize, BatchOutcome)> = stream::iter(batches.into_iter().map(|batch| {
        let gateway = gateway.clone();
        let cancel = cancel.clone();
        let config = config.clone();
        let target = target_language.to_string();
        let instructions = instructions.to_string();
        async move {
            let id = batch.id;
            let outcome = run_batch(batch, &target, &instructions, &gateway, &config, &cancel).await;
            (id, outcome)
        }
    }))
    .buffer_unordered(config.concurrency)
    .collect()
    .await;

    // Keyed reassembly: arrival order is discarded here.
    let mut results: HashMap<(usize, usize), Result<String, String>> = HashMap::new();
    let mut batch_errors: Vec<(usize, String)> = Vec::new();
    for (id, outcome) in outcomes {
        match outcome {
            BatchOutcome::Replied(map) => {
                for (key, value) in map {
                    results.insert(key, value);
                }
            }
            BatchOutcome::Failed { items, detail } => {
                for key in items {
                    results.insert(key, Err(detail.clone()));
                }
                batch_errors.push((id, detail));
            }
        }
    }

    if batch_errors.len() == batch_count {
        batch_errors.sort_by_key(|(id, _)| *id);
        return Err(PolydocError::UntranslatableDocument {
            batches: batch_count,
            first_error: batch_errors[0].1.clone(),
        });
    }

    // Sequential assembly in reading order; appendix markers are numbered
    // here so they match the order a reader encounters them.
    let mut translated = Vec::new();
    let mut failed_blocks = Vec::new();
    let mut appendix_blocks = 0usize;
    for page in pages {
        for block in &page.blocks {
            if block.text.trim().is_empty() {
                continue;
            }
            let key = (page.index, block.index);
            let (text, failed) = match results.get(&key) {
                Some(Ok(text)) => (text.clone(), false),
                Some(Err(detail)) => {
                    failed_blocks.push(BlockFailure {
                        page: page.index,
                        block: block.index,
                        detail: detail.clone(),
                    });
                    (block.text.clone(), true)
                }
                None => {
                    let detail = "block missing from batch reply".to_string();
                    failed_blocks.push(BlockFailure {
                        page: page.index,
                        block: block.index,
                        detail,
                    });
                    (block.text.clone(), true)
                }
            };

            let directive = if failed {
                // Source text by construction fits its own box.
                LayoutDirective::FitAsIs
            } else {
                match decide_placement(&text, block, room_below(page, block), config) {
                    Placement::Fit => LayoutDirective::FitAsIs,
                    Placement::Scale(scale) => LayoutDirective::ScaleFont { scale },
                    Placement::Reflow => LayoutDirective::ReflowMultiline,
                    Placement::Appendix => {
                        appendix_blocks += 1;
                        LayoutDirective::OverflowToAppendix {
                            marker: appendix_blocks,
                        }
                    }
                }
            };

            translated.push(TranslatedBlock {
                page: page.index,
                block: block.index,
                bbox: block.bbox,
                font_size: block.font_size,
                text,
                target_language: target_language.to_string(),
                directive,
                failed,
            });
        }
    }

    if !failed_blocks.is_empty() {
        warn!(
            "{} of {} blocks left untranslated",
            failed_blocks.len(),
            translated.len()
        );
    }

    let pdf = writer::render_translated(pages, &translated)?;
    Ok(TranslationOutput {
        pdf,
        failed_blocks,
        appendix_blocks,
        batches: batch_count,
    })
}

/// Greedy batching in reading order under the character budget. A single
/// oversized block still forms its own batch.
fn form_batches(pages: &[Page], char_budget: usize) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut current: Vec<WorkItem> = Vec::new();
    let mut current_chars = 0usize;

    for page in pages {
        for block in &page.blocks {
            let text = block.text.trim();
            if text.is_empty() {
                continue;
            }
            let chars = text.chars().count();
            if !current.is_empty() && current_chars + chars > char_budget {
                batches.push(Batch {
                    id: batches.len(),
                    items: std::mem::take(&mut current),
                });
                current_chars = 0;
            }
            current.push(WorkItem {
                page: page.index,
                block: block.index,
                text: text.to_string(),
            });
            current_chars += chars;
        }
    }
    if !current.is_empty() {
        batches.push(Batch {
            id: batches.len(),
            items: current,
        });
    }
    batches
}

enum BatchOutcome {
    /// Per-block results; blocks absent from the reply map to `Err`.
    Replied(HashMap<(usize, usize), Result<String, String>>),
    /// The whole call failed (or was cancelled before dispatch).
    Failed {
        items: Vec<(usize, usize)>,
        detail: String,
    },
}

async fn run_batch(
    batch: Batch,
    target_language: &str,
    instructions: &str,
    gateway: &CompletionGateway,
    config: &PipelineConfig,
    cancel: &CancelToken,
) -> BatchOutcome {
    let keys: Vec<(usize, usize)> = batch.items.iter().map(|i| (i.page, i.block)).collect();

    if cancel.is_cancelled() {
        return BatchOutcome::Failed {
            items: keys,
            detail: "run cancelled before dispatch".to_string(),
        };
    }

    // Batch-local ids; the reply maps back through them.
    let prompt_blocks: Vec<(usize, String)> = batch
        .items
        .iter()
        .enumerate()
        .map(|(i, item)| (i, item.text.clone()))
        .collect();
    let request = compose(
        &Task::TranslateBatch {
            blocks: &prompt_blocks,
            target_language,
        },
        instructions,
        config,
    );

    match gateway.complete("translate", &request).await {
        Ok(response) => {
            let by_id = parse_batch_reply(&response.text, batch.items.len());
            debug!(
                "batch {}: {}/{} blocks answered",
                batch.id,
                by_id.len(),
                batch.items.len()
            );
            let mut map = HashMap::new();
            for (i, item) in batch.items.iter().enumerate() {
                let value = match by_id.get(&i) {
                    Some(text) => Ok(text.clone()),
                    None => Err("block missing from batch reply".to_string()),
                };
                map.insert((item.page, item.block), value);
            }
            BatchOutcome::Replied(map)
        }
        Err(e) => BatchOutcome::Failed {
            items: keys,
            detail: e.to_string(),
        },
    }
}

/// Parse a marker-tagged batch reply into `id → translation`.
///
/// Tolerates reordered markers and surrounding chatter; only ids within
/// `expected` are accepted, and the first occurrence of an id wins.
fn parse_batch_reply(reply: &str, expected: usize) -> HashMap<usize, String> {
    let marks: Vec<(usize, usize, usize)> = MARKER_RE
        .captures_iter(reply)
        .filter_map(|c| {
            let whole = c.get(0)?;
            let id: usize = c.get(1)?.as_str().parse().ok()?;
            Some((id, whole.start(), whole.end()))
        })
        .collect();

    let mut out = HashMap::new();
    for (i, (id, _, end)) in marks.iter().enumerate() {
        let text_end = marks.get(i + 1).map(|m| m.1).unwrap_or(reply.len());
        let text = reply[*end..text_end].trim();
        if *id < expected && !text.is_empty() {
            out.entry(*id).or_insert_with(|| text.to_string());
        }
    }
    out
}

enum Placement {
    Fit,
    Scale(f32),
    Reflow,
    Appendix,
}

/// Measure the translation against the source geometry and pick a
/// placement. The area ratio reduces to a height ratio because the box
/// width is held fixed while measuring.
fn decide_placement(
    text: &str,
    block: &TextBlock,
    room_below: f32,
    config: &PipelineConfig,
) -> Placement {
    let width = block.bbox.width.max(block.font_size);
    let lines = writer::wrap_text(text, block.font_size, width);
    let needed_height = lines.len() as f32 * block.font_size * writer::LEADING;
    let ratio = needed_height / block.bbox.height.max(1.0);

    if ratio <= config.fit_tolerance {
        return Placement::Fit;
    }
    if ratio <= config.reflow_cutoff {
        // Scaling the font by s shrinks the needed area by roughly s².
        let scale = (1.0 / ratio).sqrt().max(config.font_scale_floor);
        return Placement::Scale(scale);
    }
    if needed_height - block.bbox.height <= room_below {
        Placement::Reflow
    } else {
        Placement::Appendix
    }
}

/// Vertical free space under a block before hitting the next overlapping
/// block or the bottom page margin.
fn room_below(page: &Page, block: &TextBlock) -> f32 {
    let bottom = block.bbox.bottom();
    let mut room = bottom - BOTTOM_MARGIN;
    for other in &page.blocks {
        if other.index == block.index {
            continue;
        }
        let overlaps_horizontally = other.bbox.x < block.bbox.x + block.bbox.width
            && other.bbox.x + other.bbox.width > block.bbox.x;
        if overlaps_horizontally && other.bbox.y <= bottom {
            room = room.min(bottom - other.bbox.y);
        }
    }
    room.max(0.0)
}
