//! Consolidating raw OCR detections into translation-ready text blocks.
//!
//! OCR engines tend to report one region per line (or even per word), and
//! speech bubbles frequently produce several overlapping detections. Before
//! we translate anything, we merge those detections into [`TextBlock`]s so
//! that each bubble is translated as a single unit.
//!
//! The merge is greedy and depends on detection order. Feeding the same
//! regions in a different order may group them differently, and callers
//! which need reproducible output must preserve the engine's order.

use std::{collections::VecDeque, fmt};

use crate::prelude::*;

/// Default fraction of a region's area which must be covered before we merge.
pub const DEFAULT_OVERLAP_THRESHOLD: f32 = 0.5;

/// Smallest font size we'll ever suggest, in pixels.
const MIN_FONT_SIZE: f32 = 8.0;

/// Largest font size we'll ever suggest, in pixels.
const MAX_FONT_SIZE: f32 = 96.0;

/// An axis-aligned bounding box in pixel coordinates.
///
/// Serialized as `[left, top, right, bottom]`.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BoundingBox {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl BoundingBox {
    /// Create a new bounding box.
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Width, or 0 for degenerate boxes.
    pub fn width(&self) -> i64 {
        (i64::from(self.right) - i64::from(self.left)).max(0)
    }

    /// Height, or 0 for degenerate boxes.
    pub fn height(&self) -> i64 {
        (i64::from(self.bottom) - i64::from(self.top)).max(0)
    }

    /// Area in square pixels. Saturates for boxes spanning most of the `i32`
    /// range in both directions.
    pub fn area(&self) -> i64 {
        self.width().saturating_mul(self.height())
    }

    /// The area shared by `self` and `other`.
    pub fn intersection_area(&self, other: &Self) -> i64 {
        let clipped = Self {
            left: self.left.max(other.left),
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
        };
        clipped.area()
    }

    /// What fraction of `self` is covered by its intersection with `other`?
    ///
    /// This is deliberately *not* IoU: `a.overlap_fraction(&b)` and
    /// `b.overlap_fraction(&a)` differ whenever the boxes differ in size. A
    /// zero-area box overlaps nothing.
    pub fn overlap_fraction(&self, other: &Self) -> f32 {
        let area = self.area();
        if area == 0 {
            return 0.0;
        }
        self.intersection_area(other) as f32 / area as f32
    }

    /// The smallest box containing both `self` and `other`.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    /// Does `self` fully contain `other`?
    pub fn contains(&self, other: &Self) -> bool {
        self.left <= other.left
            && self.top <= other.top
            && self.right >= other.right
            && self.bottom >= other.bottom
    }
}

impl From<[i32; 4]> for BoundingBox {
    fn from([left, top, right, bottom]: [i32; 4]) -> Self {
        Self::new(left, top, right, bottom)
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(bbox: BoundingBox) -> Self {
        [bbox.left, bbox.top, bbox.right, bbox.bottom]
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{})-({},{})",
            self.left, self.top, self.right, self.bottom
        )
    }
}

/// A raw text detection reported by an OCR engine.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TextRegion {
    /// The recognized text.
    pub text: String,

    /// Where the text was found.
    pub bbox: BoundingBox,

    /// The language the engine thinks this is, if it says.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,

    /// Engine confidence, if available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl TextRegion {
    /// Create a region with no language or confidence information.
    pub fn new(text: impl Into<String>, bbox: BoundingBox) -> Self {
        Self {
            text: text.into(),
            bbox,
            lang: None,
            confidence: None,
        }
    }
}

/// One or more merged [`TextRegion`]s, ready to translate and draw.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TextBlock {
    /// Source texts joined by single spaces, in detection order.
    pub text: String,

    /// Union of every contributing region's box.
    pub bbox: BoundingBox,

    /// The translation, once we have one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,

    /// Suggested font size in pixels.
    pub font_size: f32,

    /// How many OCR regions went into this block.
    pub source_count: usize,
}

impl TextBlock {
    /// Build a block from `first` and zero or more regions absorbed into it.
    fn from_regions(first: TextRegion, rest: Vec<TextRegion>) -> Self {
        let mut bbox = first.bbox;
        let mut text = first.text;
        let source_count = 1 + rest.len();
        for region in rest {
            bbox = bbox.union(&region.bbox);
            text.push(' ');
            text.push_str(&region.text);
        }
        Self {
            text,
            bbox,
            translation: None,
            font_size: estimate_font_size(&bbox, source_count),
            source_count,
        }
    }
}

/// Guess a font size from the block height, assuming each source region
/// was roughly one line.
fn estimate_font_size(bbox: &BoundingBox, source_count: usize) -> f32 {
    let lines = source_count.max(1) as f32;
    (bbox.height() as f32 / lines).clamp(MIN_FONT_SIZE, MAX_FONT_SIZE)
}

/// Merge overlapping regions into blocks.
///
/// We repeatedly take the first region left in the pool, absorb every other
/// remaining region `r` for which `current.overlap_fraction(r)` exceeds
/// `overlap_threshold`, and emit the result. Absorbed regions leave the pool
/// and are never considered again, so there's no fixpoint iteration. Blocks
/// come out in emission order, not spatial order.
pub fn merge_regions(regions: Vec<TextRegion>, overlap_threshold: f32) -> Vec<TextBlock> {
    let mut pool = VecDeque::from(regions);
    let mut blocks = Vec::with_capacity(pool.len());
    while let Some(current) = pool.pop_front() {
        let (absorbed, remaining): (Vec<_>, Vec<_>) =
            pool.into_iter().partition(|candidate| {
                current.bbox.overlap_fraction(&candidate.bbox) > overlap_threshold
            });
        pool = VecDeque::from(remaining);
        if !absorbed.is_empty() {
            trace!(
                bbox = %current.bbox,
                absorbed = absorbed.len(),
                "Merging overlapping regions"
            );
        }
        blocks.push(TextBlock::from_regions(current, absorbed));
    }
    blocks
}
