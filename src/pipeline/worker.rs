//! Processing a single page: OCR, merge, translate, compose, write.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    async_utils::{blocking::spawn_blocking_propagating_panics, io::write_file_atomically_if},
    compose::Compositor,
    job::ImageStatus,
    ocr::OcrEngine,
    page::PageImage,
    prelude::*,
    regions::{TextBlock, merge_regions},
    scan::ImageFile,
    translate::{LanguagePair, TranslationService, TranslationSource},
};

/// One page waiting in the task queue.
#[derive(Clone, Debug)]
pub struct ImageTask {
    pub image: ImageFile,
    /// Where the translated page goes. The directory already exists.
    pub output_path: PathBuf,
}

/// What happened to one page.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessingResult {
    pub image: ImageFile,
    pub status: ImageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    /// Merged blocks with their translations.
    pub blocks: Vec<TextBlock>,
    /// Everything that went wrong, including non-fatal problems.
    pub errors: Vec<String>,
}

impl ProcessingResult {
    /// A page which produced no output.
    pub fn failed(image: ImageFile, error: String) -> Self {
        Self {
            image,
            status: ImageStatus::Failed,
            output_path: None,
            blocks: vec![],
            errors: vec![error],
        }
    }
}

/// Everything a worker needs, shared by all workers.
pub(super) struct WorkerContext {
    pub ocr: Arc<dyn OcrEngine>,
    pub translation: Arc<TranslationService>,
    pub compositor: Arc<dyn Compositor>,
    pub languages: LanguagePair,
    pub overlap_threshold: f32,
}

impl WorkerContext {
    /// Process `task`. Never fails: errors end up in the result.
    #[instrument(level = "debug", skip_all, fields(chapter = %task.image.chapter, index = task.image.index))]
    pub async fn process(&self, task: ImageTask, cancel: &CancellationToken) -> ProcessingResult {
        let mut blocks = vec![];
        let mut errors = vec![];
        let outcome = self
            .process_inner(&task, &mut blocks, &mut errors, cancel)
            .await;
        let (status, output_path) = match outcome {
            Ok(Some(path)) if errors.is_empty() => (ImageStatus::Ok, Some(path)),
            Ok(Some(path)) => (ImageStatus::Degraded, Some(path)),
            Ok(None) => {
                debug!("Discarded page output after cancellation");
                (ImageStatus::Cancelled, None)
            }
            Err(err) => {
                warn!(path = %task.image.path.display(), "Failed to process page: {err:#}");
                errors.push(format!("{err:#}"));
                (ImageStatus::Failed, None)
            }
        };
        ProcessingResult {
            image: task.image,
            status,
            output_path,
            blocks,
            errors,
        }
    }

    /// Returns the output path, or `None` if we were cancelled before the
    /// output was committed.
    async fn process_inner(
        &self,
        task: &ImageTask,
        blocks: &mut Vec<TextBlock>,
        errors: &mut Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Option<PathBuf>> {
        let page = PageImage::load(&task.image.path).await?;

        let regions = match self.ocr.detect(&page).await {
            Ok(regions) => regions,
            Err(err) => {
                warn!(path = %page.path.display(), "OCR failed, treating page as blank: {err:#}");
                errors.push(format!("OCR failed: {err:#}"));
                vec![]
            }
        };
        *blocks = merge_regions(regions, self.overlap_threshold);
        trace!(blocks = blocks.len(), "Merged regions");

        for block in blocks.iter_mut() {
            let translation = self.translation.translate(&block.text, &self.languages).await;
            if let Some(error) = translation.error {
                errors.push(format!("translation of {:?} failed: {error}", block.text));
            }
            if translation.source != TranslationSource::Blank {
                block.translation = Some(translation.text);
            }
        }

        if cancel.is_cancelled() {
            return Ok(None);
        }
        let compositor = self.compositor.clone();
        let to_draw = blocks.clone();
        let composed =
            spawn_blocking_propagating_panics(move || compositor.compose(&page, &to_draw))
                .await?;

        let cancel = cancel.clone();
        let committed =
            write_file_atomically_if(&task.output_path, composed, move || !cancel.is_cancelled())
                .await?;
        Ok(committed.then(|| task.output_path.clone()))
    }
}
