//! PDF writing: emit new page streams from text plus layout directives.
//!
//! Built on `lopdf` content streams with the Helvetica base font, so output
//! never depends on fonts embedded in the source document. Two entry
//! points: [`render_translated`] rebuilds a document page-for-page from
//! [`TranslatedBlock`]s (layout-preserving), and [`render_flowed`] lays a
//! plain text out across A4 pages (summaries have no source layout to
//! preserve).
//!
//! Base-14 Type1 fonts carry WinAnsi glyphs only; characters outside that
//! set are written as '?'. Callers wanting full CJK output should post-edit
//! with an embedded font.

use crate::document::{LayoutDirective, Page, TranslatedBlock};
use crate::error::PolydocError;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, Stream};
use tracing::debug;

/// Average Helvetica glyph advance as a fraction of the font size. Exact
/// metrics vary per glyph; this approximation is what the translation
/// engine also uses, so measurement and rendering agree.
pub(crate) const AVG_CHAR_WIDTH: f32 = 0.5;

/// Line leading as a multiple of the font size.
pub(crate) const LEADING: f32 = 1.2;

const A4_WIDTH: f32 = 595.0;
const A4_HEIGHT: f32 = 842.0;
const MARGIN: f32 = 50.0;

/// Visible prefix for blocks whose translation failed.
pub(crate) const FAILURE_MARKER: &str = "[!] ";

/// Estimated rendered width of `text` at `font_size`, in points.
pub(crate) fn text_width(text: &str, font_size: f32) -> f32 {
    text.chars().count() as f32 * font_size * AVG_CHAR_WIDTH
}

/// Greedy word-wrap of `text` into lines no wider than `max_width` points.
///
/// A word longer than the line is hard-split rather than overflowing, so
/// the result always respects `max_width` (given at least one glyph fits).
pub(crate) fn wrap_text(text: &str, font_size: f32, max_width: f32) -> Vec<String> {
    let max_chars = ((max_width / (font_size * AVG_CHAR_WIDTH)) as usize).max(1);
    let mut lines = Vec::new();

    for paragraph in text.split('\n') {
        let mut current = String::new();
        for word in paragraph.split_whitespace() {
            let candidate_len = if current.is_empty() {
                word.chars().count()
            } else {
                current.chars().count() + 1 + word.chars().count()
            };
            if candidate_len <= max_chars {
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(word);
            } else {
                if !current.is_empty() {
                    lines.push(std::mem::take(&mut current));
                }
                // Hard-split oversized words.
                let mut rest: Vec<char> = word.chars().collect();
                while rest.len() > max_chars {
                    lines.push(rest.drain(..max_chars).collect());
                }
                current = rest.into_iter().collect();
            }
        }
        if !current.is_empty() || paragraph.trim().is_empty() {
            lines.push(current);
        }
    }

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

/// Base-14 fonts address WinAnsi; anything else becomes '?'.
fn encode_winansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| {
            let code = c as u32;
            if code < 256 {
                code as u8
            } else {
                b'?'
            }
        })
        .collect()
}

/// Builds one document, page by page.
struct PdfBuilder {
    doc: Document,
    pages_id: lopdf::ObjectId,
    font_id: lopdf::ObjectId,
    page_ids: Vec<Object>,
}

impl PdfBuilder {
    fn new() -> Self {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });
        Self {
            doc,
            pages_id,
            font_id,
            page_ids: Vec::new(),
        }
    }

    fn resources(&self) -> Dictionary {
        dictionary! {
            "Font" => dictionary! { "F1" => self.font_id },
        }
    }

    fn push_page(
        &mut self,
        width: f32,
        height: f32,
        operations: Vec<Operation>,
    ) -> Result<(), PolydocError> {
        let content = Content { operations };
        let encoded = content
            .encode()
            .map_err(|e| PolydocError::PdfWriteFailed(e.to_string()))?;
        let stream_id = self.doc.add_object(Stream::new(dictionary! {}, encoded));
        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "MediaBox" => vec![0.into(), 0.into(), width.into(), height.into()],
            "Contents" => stream_id,
            "Resources" => self.resources(),
        });
        self.page_ids.push(page_id.into());
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<u8>, PolydocError> {
        let count = self.page_ids.len() as i64;
        self.doc.objects.insert(
            self.pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => self.page_ids,
                "Count" => count,
            }),
        );
        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);
        self.doc.compress();

        let mut buf = Vec::new();
        self.doc
            .save_to(&mut buf)
            .map_err(|e| PolydocError::PdfWriteFailed(e.to_string()))?;
        Ok(buf)
    }
}

/// Emit `Tf`/`Td`/`Tj` operations for a run of lines starting at the given
/// top edge, walking downward by the font leading.
fn text_ops(lines: &[String], x: f32, top_y: f32, font_size: f32) -> Vec<Operation> {
    let mut ops = vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec!["F1".into(), font_size.into()]),
    ];
    // First baseline sits a cap-height below the box top.
    let mut baseline = top_y - font_size * 0.8;
    let mut first = true;
    for line in lines {
        if first {
            ops.push(Operation::new("Td", vec![x.into(), baseline.into()]));
            first = false;
        } else {
            ops.push(Operation::new(
                "Td",
                vec![0.into(), (-font_size * LEADING).into()],
            ));
        }
        ops.push(Operation::new(
            "Tj",
            vec![Object::String(
                encode_winansi(line),
                lopdf::StringFormat::Literal,
            )],
        ));
        baseline -= font_size * LEADING;
    }
    ops.push(Operation::new("ET", vec![]));
    ops
}

/// Render a layout-preserving translated document.
///
/// One output page per source page (zero-text pages pass through as blank
/// pages with the source dimensions), followed by appendix pages for any
/// [`LayoutDirective::OverflowToAppendix`] blocks. `translated` must be
/// sorted by `(page, block)` — the caller reassembles concurrent batch
/// results before rendering, never by arrival order.
pub fn render_translated(
    source_pages: &[Page],
    translated: &[TranslatedBlock],
) -> Result<Vec<u8>, PolydocError> {
    let mut builder = PdfBuilder::new();
    let mut appendix: Vec<(usize, String)> = Vec::new();

    for page in source_pages {
        let mut ops: Vec<Operation> = Vec::new();
        for tb in translated.iter().filter(|t| t.page == page.index) {
            ops.extend(block_ops(tb, &mut appendix));
        }
        builder.push_page(page.width, page.height, ops)?;
    }

    if !appendix.is_empty() {
        debug!("rendering {} appendix entries", appendix.len());
        render_appendix(&mut builder, &appendix)?;
    }

    builder.finish()
}

/// Operations for one translated block according to its directive.
fn block_ops(tb: &TranslatedBlock, appendix: &mut Vec<(usize, String)>) -> Vec<Operation> {
    let text = if tb.failed {
        format!("{FAILURE_MARKER}{}", tb.text)
    } else {
        tb.text.clone()
    };

    match tb.directive {
        LayoutDirective::FitAsIs => {
            let lines = wrap_text(&text, tb.font_size, tb.bbox.width.max(tb.font_size));
            text_ops(&lines, tb.bbox.x, tb.bbox.y, tb.font_size)
        }
        LayoutDirective::ScaleFont { scale } => {
            let size = tb.font_size * scale;
            let lines = wrap_text(&text, size, tb.bbox.width.max(size));
            text_ops(&lines, tb.bbox.x, tb.bbox.y, size)
        }
        LayoutDirective::ReflowMultiline => {
            // Wrap within the box width; the growing height was validated
            // against free page space by the translation engine.
            let lines = wrap_text(&text, tb.font_size, tb.bbox.width.max(tb.font_size));
            text_ops(&lines, tb.bbox.x, tb.bbox.y, tb.font_size)
        }
        LayoutDirective::OverflowToAppendix { marker } => {
            appendix.push((marker, text));
            let note = format!("[see appendix note {marker}]");
            text_ops(
                &[note],
                tb.bbox.x,
                tb.bbox.y,
                tb.font_size.min(9.0),
            )
        }
    }
}

/// Trailing appendix pages: one numbered flowed entry per overflowed block.
fn render_appendix(
    builder: &mut PdfBuilder,
    entries: &[(usize, String)],
) -> Result<(), PolydocError> {
    let font_size = 10.0;
    let leading = font_size * LEADING;
    let usable_width = A4_WIDTH - 2.0 * MARGIN;

    let mut lines: Vec<String> = vec!["Appendix: overflowed blocks".to_string(), String::new()];
    for (marker, text) in entries {
        for (i, line) in wrap_text(text, font_size, usable_width).into_iter().enumerate() {
            if i == 0 {
                lines.push(format!("[{marker}] {line}"));
            } else {
                lines.push(format!("    {line}"));
            }
        }
        lines.push(String::new());
    }

    let per_page = (((A4_HEIGHT - 2.0 * MARGIN) / leading) as usize).max(1);
    for chunk in lines.chunks(per_page) {
        let ops = text_ops(chunk, MARGIN, A4_HEIGHT - MARGIN, font_size);
        builder.push_page(A4_WIDTH, A4_HEIGHT, ops)?;
    }
    Ok(())
}

/// Render plain text as a simple flowed A4 document (summary PDFs).
pub fn render_flowed(text: &str) -> Result<Vec<u8>, PolydocError> {
    let font_size = 11.0;
    let leading = font_size * LEADING;
    let usable_width = A4_WIDTH - 2.0 * MARGIN;

    let lines = wrap_text(text, font_size, usable_width);
    let per_page = (((A4_HEIGHT - 2.0 * MARGIN) / leading) as usize).max(1);

    let mut builder = PdfBuilder::new();
    if lines.is_empty() {
        builder.push_page(A4_WIDTH, A4_HEIGHT, Vec::new())?;
    }
    for chunk in lines.chunks(per_page) {
        let ops = text_ops(chunk, MARGIN, A4_HEIGHT - MARGIN, font_size);
        builder.push_page(A4_WIDTH, A4_HEIGHT, ops)?;
    }
    builder.finish()
}
