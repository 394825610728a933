//! Putting translated blocks back onto a page.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

use crate::{page::PageImage, prelude::*, regions::TextBlock};

/// Turns a page plus its translated blocks into encoded output bytes.
///
/// Compositors are CPU-bound and synchronous. The pipeline runs them on the
/// blocking thread pool.
pub trait Compositor: Send + Sync + 'static {
    fn compose(&self, page: &PageImage, blocks: &[TextBlock]) -> Result<Vec<u8>>;
}

/// Blanks out every translated block with a solid fill, ready for lettering.
///
/// We don't typeset the translation ourselves. The block's text and font size
/// estimate end up in the batch report for whatever does.
pub struct BoxFillCompositor {
    fill: Rgba<u8>,
}

impl Default for BoxFillCompositor {
    fn default() -> Self {
        Self {
            fill: Rgba([255, 255, 255, 255]),
        }
    }
}

impl BoxFillCompositor {
    fn paint(&self, canvas: &mut RgbaImage, block: &TextBlock) {
        let (width, height) = (canvas.width() as i64, canvas.height() as i64);
        let clamp = |v: i32, max: i64| (v as i64).clamp(0, max) as u32;
        let (left, right) = (clamp(block.bbox.left, width), clamp(block.bbox.right, width));
        let (top, bottom) = (clamp(block.bbox.top, height), clamp(block.bbox.bottom, height));
        for y in top..bottom {
            for x in left..right {
                canvas.put_pixel(x, y, self.fill);
            }
        }
    }
}

impl Compositor for BoxFillCompositor {
    #[instrument(level = "debug", skip_all, fields(path = %page.path.display(), blocks = blocks.len()))]
    fn compose(&self, page: &PageImage, blocks: &[TextBlock]) -> Result<Vec<u8>> {
        let format = page.format()?;
        let decoded = image::load_from_memory_with_format(&page.data, format)
            .with_context(|| format!("cannot decode {:?}", page.path))?;

        let mut canvas = decoded.to_rgba8();
        for block in blocks.iter().filter(|b| b.translation.is_some()) {
            self.paint(&mut canvas, block);
        }

        // JPEG has no alpha channel.
        let composed = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(canvas).to_rgb8()),
            _ => DynamicImage::ImageRgba8(canvas),
        };
        let mut out = Cursor::new(Vec::with_capacity(page.data.len()));
        composed
            .write_to(&mut out, format)
            .with_context(|| format!("cannot encode {:?} as {:?}", page.path, format))?;
        Ok(out.into_inner())
    }
}
