//! In-memory document model produced by the layout reader.
//!
//! One [`Document`] is owned exclusively by one pipeline run and never shared
//! across concurrent documents, so nothing here needs interior mutability or
//! locking. Downstream engines treat [`TextBlock`]s as read-only; the
//! translation engine emits *new* [`TranslatedBlock`]s instead of mutating the
//! originals, which keeps re-runs idempotent.

use serde::{Deserialize, Serialize};

/// Immutable pipeline input: raw PDF bytes plus the original filename.
///
/// Created at request entry, dropped when the run completes. The bytes are
/// never mutated; every artifact is derived into separate buffers.
#[derive(Debug, Clone)]
pub struct Document {
    /// Raw PDF bytes as uploaded/read.
    pub bytes: Vec<u8>,
    /// Original filename, used only for naming derived artifacts.
    pub filename: String,
}

impl Document {
    pub fn new(bytes: Vec<u8>, filename: impl Into<String>) -> Self {
        Self {
            bytes,
            filename: filename.into(),
        }
    }
}

/// One physical PDF page: dimensions in points plus its text blocks in
/// visual reading order (top-to-bottom, then left-to-right).
///
/// A page with no extractable text (scanned image) has an empty `blocks`
/// vector — it is not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    /// 0-indexed page number.
    pub index: usize,
    /// Page width in PDF points.
    pub width: f32,
    /// Page height in PDF points.
    pub height: f32,
    /// Text blocks in reading order.
    pub blocks: Vec<TextBlock>,
}

impl Page {
    /// Concatenated text of all blocks, newline-separated.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            out.push_str(&block.text);
            out.push('\n');
        }
        out
    }
}

/// Axis-aligned rectangle in PDF points. `y` is the TOP edge in page space
/// (PDF coordinates grow upward; the reader converts so that smaller `y`
/// means higher on the page is NOT assumed — `y` here is distance from the
/// page bottom to the top edge, matching pdfium's char bounds).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge.
    pub x: f32,
    /// Top edge, measured from the page bottom (PDF convention).
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Bottom edge in PDF coordinates.
    pub fn bottom(&self) -> f32 {
        self.y - self.height
    }
}

/// A contiguous run of text sharing layout, as found on the source page.
///
/// Invariant: the bounding box lies within the owning [`Page`]'s dimensions
/// (the reader clamps stray glyph bounds reported outside the media box).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBlock {
    /// 0-indexed position within the page's reading order.
    pub index: usize,
    pub text: String,
    pub bbox: BoundingBox,
    /// Dominant font family on the block, when pdfium reports one.
    pub font_family: Option<String>,
    /// Dominant font size in points.
    pub font_size: f32,
    /// Number of visual lines the block spanned in the source.
    pub line_count: usize,
}

/// How the writer should place a translated block whose text length no
/// longer matches the source geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LayoutDirective {
    /// Translation fits the original box at the original font size.
    FitAsIs,
    /// Shrink the font by `scale` (bounded below by the configured floor).
    ScaleFont { scale: f32 },
    /// Wrap within the box width, growing the box downward into free page
    /// space below the original position.
    ReflowMultiline,
    /// No room left on the page: full text goes to a trailing appendix page,
    /// a footnote marker is left at the original position.
    OverflowToAppendix { marker: usize },
}

/// A [`TextBlock`] joined with its translation and placement decision.
///
/// Produced by the translation engine, consumed only by the PDF writer. The
/// original block is kept by reference to its `(page, block)` key so the
/// writer can fall back to source text for failed blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatedBlock {
    /// 0-indexed page the source block belongs to.
    pub page: usize,
    /// Source block index within the page.
    pub block: usize,
    /// Source geometry, copied so the writer needs no access to the
    /// original `Page` tree.
    pub bbox: BoundingBox,
    /// Source font size in points.
    pub font_size: f32,
    /// Translated text; equals the source text when the block's translation
    /// failed (the writer then adds a visible marker).
    pub text: String,
    /// BCP-47-ish target language tag the text is written in.
    pub target_language: String,
    pub directive: LayoutDirective,
    /// True when translation failed and `text` is the untranslated source.
    pub failed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(text: &str) -> TextBlock {
        TextBlock {
            index: 0,
            text: text.to_string(),
            bbox: BoundingBox {
                x: 50.0,
                y: 700.0,
                width: 200.0,
                height: 14.0,
            },
            font_family: Some("Helvetica".into()),
            font_size: 11.0,
            line_count: 1,
        }
    }

    #[test]
    fn page_text_concatenates_blocks_in_order() {
        let page = Page {
            index: 0,
            width: 595.0,
            height: 842.0,
            blocks: vec![
                TextBlock {
                    index: 0,
                    ..block("first")
                },
                TextBlock {
                    index: 1,
                    ..block("second")
                },
            ],
        };
        assert_eq!(page.text(), "first\nsecond\n");
    }

    #[test]
    fn bbox_area_and_bottom() {
        let b = BoundingBox {
            x: 10.0,
            y: 100.0,
            width: 50.0,
            height: 20.0,
        };
        assert_eq!(b.area(), 1000.0);
        assert_eq!(b.bottom(), 80.0);
    }
}
