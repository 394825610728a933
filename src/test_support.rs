//! Fake collaborators and fixtures for unit tests.

use std::{
    collections::{HashMap, HashSet},
    io::Cursor,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use image::{ImageFormat, Rgba, RgbaImage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::TranslationCache,
    ocr::OcrEngine,
    page::PageImage,
    prelude::*,
    regions::TextRegion,
    translate::{LanguagePair, TranslationService, Translator, TranslatorPool},
};

/// A solid black PNG.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255]));
    let mut out = Cursor::new(vec![]);
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Write a small PNG page to `path`, creating parent folders.
pub fn write_page(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, png_bytes(16, 16)).unwrap();
}

fn page_name(page: &PageImage) -> String {
    page.path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// An OCR engine that returns the same canned regions for every page, except
/// for pages scripted to fail, panic or stall.
#[derive(Default)]
pub struct ScriptedOcr {
    default_regions: Vec<TextRegion>,
    failing: HashSet<String>,
    panicking: HashSet<String>,
    delays: HashMap<String, Duration>,
    not_ready: bool,
}

impl ScriptedOcr {
    pub fn with_default_regions(mut self, regions: Vec<TextRegion>) -> Self {
        self.default_regions = regions;
        self
    }

    pub fn failing_on(mut self, name: &str) -> Self {
        self.failing.insert(name.to_owned());
        self
    }

    pub fn panicking_on(mut self, name: &str) -> Self {
        self.panicking.insert(name.to_owned());
        self
    }

    pub fn delaying(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_owned(), delay);
        self
    }

    pub fn not_ready(mut self) -> Self {
        self.not_ready = true;
        self
    }
}

#[async_trait]
impl OcrEngine for ScriptedOcr {
    async fn ensure_ready(&self) -> Result<()> {
        if self.not_ready {
            Err(anyhow!("model not installed"))
        } else {
            Ok(())
        }
    }

    async fn detect(&self, page: &PageImage) -> Result<Vec<TextRegion>> {
        let name = page_name(page);
        if let Some(delay) = self.delays.get(&name) {
            tokio::time::sleep(*delay).await;
        }
        if self.panicking.contains(&name) {
            panic!("scripted OCR panic for {name}");
        }
        if self.failing.contains(&name) {
            return Err(anyhow!("scripted OCR failure for {name}"));
        }
        Ok(self.default_regions.clone())
    }
}

/// An OCR engine which reports each page it starts, then waits for `release`.
pub struct GatedOcr {
    started: mpsc::UnboundedSender<PathBuf>,
    release: CancellationToken,
}

impl GatedOcr {
    pub fn new(release: CancellationToken) -> (Self, mpsc::UnboundedReceiver<PathBuf>) {
        let (started, rx) = mpsc::unbounded_channel();
        (Self { started, release }, rx)
    }
}

#[async_trait]
impl OcrEngine for GatedOcr {
    async fn detect(&self, page: &PageImage) -> Result<Vec<TextRegion>> {
        let _ = self.started.send(page.path.clone());
        self.release.cancelled().await;
        Ok(vec![])
    }
}

/// Translates to `<target> text` and counts calls.
pub struct CountingTranslator {
    target: String,
    calls: Arc<AtomicUsize>,
    delay: Duration,
}
impl CountingTranslator {
    pub fn new(pair: &LanguagePair, calls: Arc<AtomicUsize>) -> Self {
        Self {
            target: pair.target.clone(),
            calls,
            delay: Duration::ZERO,
        }
    }

    /// Take `delay` over every translation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Translator for CountingTranslator {
    async fn translate(&self, text: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(format!("<{}> {}", self.target, text))
    }
}

/// Always fails.
pub struct FailingTranslator;

#[async_trait]
impl Translator for FailingTranslator {
    async fn translate(&self, _text: &str) -> Result<String> {
        Err(anyhow!("translation service unavailable"))
    }
}

/// A [`TranslationService`] backed by [`CountingTranslator`], plus its call
/// counter.
pub fn counting_service(
    cache: Option<TranslationCache>,
) -> (Arc<TranslationService>, Arc<AtomicUsize>) {
    slow_counting_service(cache, Duration::ZERO)
}

/// Like [`counting_service`], but every translation takes `delay`.
pub fn slow_counting_service(
    cache: Option<TranslationCache>,
    delay: Duration,
) -> (Arc<TranslationService>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let pool_calls = calls.clone();
    let pool = TranslatorPool::new(Box::new(move |pair: &LanguagePair| {
        let translator = CountingTranslator::new(pair, pool_calls.clone()).with_delay(delay);
        Ok(Arc::new(translator) as Arc<dyn Translator>)
    }));
    (Arc::new(TranslationService::new(pool, cache)), calls)
}
