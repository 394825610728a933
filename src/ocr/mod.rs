//! OCR engine interface.
//!
//! An engine turns a page image into raw [`TextRegion`]s. The pipeline
//! treats engine failures as "no text found" rather than failing the page,
//! so engines should return errors freely.

use std::sync::Arc;

use clap::{Args, ValueEnum};

use crate::{page::PageImage, prelude::*, regions::TextRegion};

pub mod sidecar;
pub mod tesseract;

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Check that the engine can run at all (binaries installed, models
    /// present). Called once per batch, before any page is queued.
    async fn ensure_ready(&self) -> Result<()> {
        Ok(())
    }

    /// Detect text regions on a page, in the engine's natural reading order.
    async fn detect(&self, page: &PageImage) -> Result<Vec<TextRegion>>;
}

/// Our different OCR engines.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum OcrEngineType {
    /// Run the `tesseract` command-line tool.
    #[default]
    Tesseract,

    /// Read precomputed regions from `<image>.ocr.json` next to each page.
    Sidecar,
}

/// OCR-related options.
#[derive(Args, Clone, Debug)]
pub struct OcrOpts {
    /// The OCR engine to use.
    #[clap(long = "ocr", value_enum, default_value_t = OcrEngineType::default())]
    pub engine: OcrEngineType,

    /// Tesseract language model(s), such as `jpn`, `jpn_vert` or `jpn+eng`.
    #[clap(long, default_value = "jpn")]
    pub tesseract_lang: String,
}

impl OcrOpts {
    /// Instantiate the configured engine.
    pub fn create_engine(&self) -> Arc<dyn OcrEngine> {
        match self.engine {
            OcrEngineType::Tesseract => {
                Arc::new(tesseract::TesseractOcrEngine::new(&self.tesseract_lang))
            }
            OcrEngineType::Sidecar => Arc::new(sidecar::SidecarOcrEngine),
        }
    }
}
