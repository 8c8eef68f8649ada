//! PDF layout reading: positioned text blocks per page via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async
//! contexts. `tokio::task::spawn_blocking` moves the work onto the blocking
//! thread pool so Tokio workers never stall during extraction.
//!
//! ## Reading order
//!
//! pdfium reports glyphs in content-stream order, which on real documents is
//! frequently NOT visual order. We therefore sort characters geometrically —
//! top-to-bottom with a tolerance band so same-line fragments group
//! together, then left-to-right — before assembling lines and blocks. The
//! tolerance and word-gap thresholds derive from the page's median glyph
//! height, so dense small-print pages and posters both segment sensibly.

use crate::config::PipelineConfig;
use crate::document::{BoundingBox, Page, TextBlock};
use crate::error::PolydocError;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::{debug, info, warn};

/// One glyph with its geometry, the unit everything else is built from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Glyph {
    pub ch: char,
    /// Left edge in points.
    pub x: f32,
    /// Top edge in points (PDF coordinates, origin bottom-left).
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Read a PDF into pages of ordered text blocks.
///
/// Pure transform: no side effects, page order preserved. Pages with no
/// extractable text (scanned images) come back with an empty block list
/// rather than failing the document. Fails with
/// [`PolydocError::UnreadablePdf`] on corrupt input and with the password
/// variants on encrypted input.
pub async fn read_pages(
    pdf_path: &Path,
    config: &PipelineConfig,
) -> Result<Vec<Page>, PolydocError> {
    let path = pdf_path.to_path_buf();
    let password = config.password.clone();

    tokio::task::spawn_blocking(move || read_pages_blocking(&path, password.as_deref()))
        .await
        .map_err(|e| PolydocError::Internal(format!("layout task panicked: {e}")))?
}

/// Blocking implementation of [`read_pages`].
fn read_pages_blocking(
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<Vec<Page>, PolydocError> {
    let pdfium = bind_pdfium()?;

    let document = pdfium.load_pdf_from_file(pdf_path, password).map_err(|e| {
        let err_str = format!("{e:?}");
        if err_str.contains("Password") || err_str.contains("password") {
            if password.is_some() {
                PolydocError::WrongPassword {
                    path: pdf_path.to_path_buf(),
                }
            } else {
                PolydocError::PasswordRequired {
                    path: pdf_path.to_path_buf(),
                }
            }
        } else {
            PolydocError::UnreadablePdf {
                path: pdf_path.to_path_buf(),
                detail: err_str,
            }
        }
    })?;

    let pdf_pages = document.pages();
    let total = pdf_pages.len() as usize;
    info!("PDF loaded: {} pages", total);

    let mut pages = Vec::with_capacity(total);
    for index in 0..total {
        let page = pdf_pages
            .get(index as u16)
            .map_err(|e| PolydocError::UnreadablePdf {
                path: pdf_path.to_path_buf(),
                detail: format!("page {}: {e:?}", index + 1),
            })?;

        let width = page.width().value;
        let height = page.height().value;

        let glyphs = match page.text() {
            Ok(text_page) => collect_glyphs(&text_page),
            // A page without a text layer is a scanned image, not an error.
            Err(_) => Vec::new(),
        };

        if glyphs.is_empty() {
            debug!("page {}: no extractable text", index + 1);
            pages.push(Page {
                index,
                width,
                height,
                blocks: Vec::new(),
            });
            continue;
        }

        let blocks = group_into_blocks(glyphs, width, height);
        debug!("page {}: {} blocks", index + 1, blocks.len());
        pages.push(Page {
            index,
            width,
            height,
            blocks,
        });
    }

    Ok(pages)
}

/// Bind to the pdfium shared library: `PDFIUM_LIB_PATH` first, then the
/// system search path.
fn bind_pdfium() -> Result<Pdfium, PolydocError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(lib_path) => {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&lib_path))
        }
        Err(_) => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| PolydocError::PdfiumBindingFailed(format!("{e:?}")))?;
    Ok(Pdfium::new(bindings))
}

/// Collect every glyph on the page with its loose bounds.
fn collect_glyphs(text_page: &PdfPageText) -> Vec<Glyph> {
    let mut glyphs = Vec::new();
    for segment in text_page.segments().iter() {
        let Ok(chars) = segment.chars() else {
            continue;
        };
        for glyph in chars.iter() {
            let Some(ch) = glyph.unicode_char() else {
                continue;
            };
            if ch == '\n' || ch == '\r' {
                continue;
            }
            let Ok(bounds) = glyph.loose_bounds() else {
                continue;
            };
            glyphs.push(Glyph {
                ch,
                x: bounds.left().value,
                y: bounds.top().value,
                width: bounds.width().value,
                height: bounds.height().value,
            });
        }
    }
    glyphs
}

/// Group glyphs into reading-order text blocks.
///
/// Three passes: geometric sort, line assembly within a Y tolerance band,
/// then merging of vertically adjacent lines into blocks. All thresholds
/// scale with the page's median glyph height so the same code handles
/// footnotes and headlines.
pub(crate) fn group_into_blocks(mut glyphs: Vec<Glyph>, page_w: f32, page_h: f32) -> Vec<TextBlock> {
    let median_h = median_height(&glyphs).max(1.0);
    let y_tolerance = (median_h * 0.5).clamp(3.0, 8.0);
    let word_gap = (median_h * 0.33).max(2.0);

    // Top-to-bottom (descending Y in PDF space), then left-to-right.
    glyphs.sort_by(|a, b| {
        b.y.partial_cmp(&a.y)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.x.partial_cmp(&b.x).unwrap_or(std::cmp::Ordering::Equal))
    });

    let lines = assemble_lines(glyphs, y_tolerance, word_gap);
    merge_lines_into_blocks(lines, median_h, page_w, page_h)
}

struct Line {
    text: String,
    bbox: BoundingBox,
    glyph_height: f32,
}

fn median_height(glyphs: &[Glyph]) -> f32 {
    let mut heights: Vec<f32> = glyphs
        .iter()
        .map(|g| g.height)
        .filter(|h| *h > 0.0)
        .collect();
    if heights.is_empty() {
        return 0.0;
    }
    heights.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    heights[heights.len() / 2]
}

/// Fold sorted glyphs into visual lines, inserting spaces at word gaps.
fn assemble_lines(glyphs: Vec<Glyph>, y_tolerance: f32, word_gap: f32) -> Vec<Line> {
    let mut lines: Vec<Vec<Glyph>> = Vec::new();
    let mut current: Vec<Glyph> = Vec::new();
    let mut current_y: Option<f32> = None;

    for glyph in glyphs {
        match current_y {
            Some(y) if (y - glyph.y).abs() <= y_tolerance => current.push(glyph),
            _ => {
                if !current.is_empty() {
                    lines.push(std::mem::take(&mut current));
                }
                current_y = Some(glyph.y);
                current.push(glyph);
            }
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }

    lines
        .into_iter()
        .map(|mut line| {
            line.sort_by(|a, b| a.x.partial_cmp(&b.x).unwrap_or(std::cmp::Ordering::Equal));

            let mut text = String::new();
            let mut prev_right: Option<f32> = None;
            for g in &line {
                if let Some(right) = prev_right {
                    if g.x - right > word_gap && g.ch != ' ' && !text.ends_with(' ') {
                        text.push(' ');
                    }
                }
                text.push(g.ch);
                prev_right = Some(g.x + g.width);
            }

            let left = line.iter().map(|g| g.x).fold(f32::INFINITY, f32::min);
            let right = line
                .iter()
                .map(|g| g.x + g.width)
                .fold(f32::NEG_INFINITY, f32::max);
            let top = line.iter().map(|g| g.y).fold(f32::NEG_INFINITY, f32::max);
            let bottom = line
                .iter()
                .map(|g| g.y - g.height)
                .fold(f32::INFINITY, f32::min);

            let mut heights: Vec<f32> = line.iter().map(|g| g.height).collect();
            heights.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let glyph_height = heights[heights.len() / 2];

            Line {
                text: text.trim_end().to_string(),
                bbox: BoundingBox {
                    x: left,
                    y: top,
                    width: right - left,
                    height: top - bottom,
                },
                glyph_height,
            }
        })
        .filter(|l| !l.text.trim().is_empty())
        .collect()
}

/// Merge consecutive lines whose vertical gap is within normal leading into
/// one block. Columns and table cells keep separate blocks because their
/// geometry breaks adjacency, which is what protects tabular alignment
/// downstream.
fn merge_lines_into_blocks(
    lines: Vec<Line>,
    median_h: f32,
    page_w: f32,
    page_h: f32,
) -> Vec<TextBlock> {
    let leading_limit = median_h * 1.6;
    let mut blocks: Vec<TextBlock> = Vec::new();
    let mut group: Vec<Line> = Vec::new();

    let flush = |group: &mut Vec<Line>, blocks: &mut Vec<TextBlock>| {
        if group.is_empty() {
            return;
        }
        let text = group
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let left = group.iter().map(|l| l.bbox.x).fold(f32::INFINITY, f32::min);
        let right = group
            .iter()
            .map(|l| l.bbox.x + l.bbox.width)
            .fold(f32::NEG_INFINITY, f32::max);
        let top = group
            .iter()
            .map(|l| l.bbox.y)
            .fold(f32::NEG_INFINITY, f32::max);
        let bottom = group
            .iter()
            .map(|l| l.bbox.bottom())
            .fold(f32::INFINITY, f32::min);

        let mut sizes: Vec<f32> = group.iter().map(|l| l.glyph_height).collect();
        sizes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let font_size = sizes[sizes.len() / 2].clamp(4.0, 72.0);

        // Invariant: block geometry stays inside the page.
        let x = left.clamp(0.0, page_w);
        let y = top.clamp(0.0, page_h);
        let bbox = BoundingBox {
            x,
            y,
            width: (right - left).clamp(0.0, page_w - x),
            height: (top - bottom).clamp(0.0, y),
        };

        blocks.push(TextBlock {
            index: blocks.len(),
            text,
            bbox,
            font_family: None,
            font_size,
            line_count: group.len(),
        });
        group.clear();
    };

    for line in lines {
        let adjacent = group.last().map_or(true, |prev: &Line| {
            let gap = prev.bbox.bottom() - line.bbox.y;
            // Same block only when the next line starts within normal
            // leading AND overlaps horizontally (column breaks split here).
            let overlaps = line.bbox.x < prev.bbox.x + prev.bbox.width
                && prev.bbox.x < line.bbox.x + line.bbox.width;
            gap > -y_overlap_slack(median_h) && gap <= leading_limit && overlaps
        });
        if !adjacent {
            flush(&mut group, &mut blocks);
        }
        group.push(line);
    }
    flush(&mut group, &mut blocks);

    if blocks.is_empty() {
        warn!("page produced lines but no blocks after merging");
    }
    blocks
}

/// Lines in the same visual row can overlap vertically by a fraction of a
/// glyph before we treat them as out of order.
fn y_overlap_slack(median_h: f32) -> f32 {
    (median_h * 0.5).max(2.0)
}
