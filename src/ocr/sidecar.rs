//! An "OCR" engine that reads detections computed ahead of time.
//!
//! For a page `ch1/003.png`, we look for `ch1/003.png.ocr.json` containing a
//! JSON array of regions:
//!
//! ```json
//! [{ "text": "なに?", "bbox": [120, 40, 220, 180], "confidence": 91.5 }]
//! ```
//!
//! Coordinates must lie within ±1,048,576 pixels. A file with anything
//! outside that range is rejected as a whole, like a malformed one.
//!
//! A page without a sidecar file simply has no text. This is handy for
//! re-running translation over detections from an external tool, and for
//! tests.

use std::ffi::OsString;

use crate::{
    page::PageImage,
    prelude::*,
    regions::{BoundingBox, TextRegion},
};

use super::OcrEngine;

/// Suffix appended to the page's file name.
const SIDECAR_SUFFIX: &str = ".ocr.json";

/// Largest coordinate magnitude we accept. Far bigger than any real page.
const MAX_COORDINATE: i32 = 1 << 20;

/// Reads `<page>.ocr.json` files.
pub struct SidecarOcrEngine;

/// Path of the sidecar file for `page_path`.
pub fn sidecar_path(page_path: &Path) -> PathBuf {
    let mut path = OsString::from(page_path.as_os_str());
    path.push(SIDECAR_SUFFIX);
    PathBuf::from(path)
}

#[async_trait]
impl OcrEngine for SidecarOcrEngine {
    #[instrument(level = "debug", skip_all, fields(path = %page.path.display()))]
    async fn detect(&self, page: &PageImage) -> Result<Vec<TextRegion>> {
        let path = sidecar_path(&page.path);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                trace!("No sidecar file");
                return Ok(vec![]);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("cannot read {:?}", path));
            }
        };
        let regions = serde_json::from_slice::<Vec<TextRegion>>(&data)
            .with_context(|| format!("cannot parse OCR regions in {:?}", path))?;
        if let Some(bad) = regions.iter().find(|region| !in_range(&region.bbox)) {
            return Err(anyhow!(
                "OCR region {} in {:?} is outside ±{} pixels",
                bad.bbox,
                path,
                MAX_COORDINATE
            ));
        }
        Ok(regions)
    }
}

fn in_range(bbox: &BoundingBox) -> bool {
    [bbox.left, bbox.top, bbox.right, bbox.bottom]
        .iter()
        .all(|v| (-MAX_COORDINATE..=MAX_COORDINATE).contains(v))
}
