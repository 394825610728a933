//! The `translate` subcommand.

use std::{sync::Arc, time::Duration};

use clap::Args;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    async_utils::io::JsonlWriter,
    compose::BoxFillCompositor,
    job::{BatchOutcome, JobSnapshot},
    ocr::OcrOpts,
    pipeline::{BatchReport, Pipeline, PipelineOpts},
    prelude::*,
    translate::{TranslationService, TranslatorOpts},
    ui::Ui,
};

use super::CacheOpts;

/// How often the cache is swept and saved during a long batch.
const CACHE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Options for `translate`.
#[derive(Debug, Args)]
pub struct TranslateOpts {
    /// A chapter folder, or a series folder containing chapter folders.
    /// Output goes to a sibling folder with `-translated` appended.
    pub input: PathBuf,

    /// Write one JSON line per page (status, errors, text blocks and
    /// translations) to this file.
    #[clap(long)]
    pub report: Option<PathBuf>,

    /// What portion of pages should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "1.0")]
    pub allowed_failure_rate: f32,

    #[clap(flatten)]
    pub pipeline: PipelineOpts,

    #[clap(flatten)]
    pub translator: TranslatorOpts,

    #[clap(flatten)]
    pub ocr: OcrOpts,

    #[clap(flatten)]
    pub cache: CacheOpts,
}

/// Translate a chapter or series.
#[instrument(level = "debug", skip_all, fields(input = %opts.input.display()))]
pub async fn cmd_translate(ui: &Ui, opts: &TranslateOpts) -> Result<()> {
    let cache = match opts.cache.open().await {
        Ok(cache) => cache,
        Err(err) => {
            warn!("Translation cache unavailable, continuing without it: {err:#}");
            None
        }
    };
    if let Some(cache) = &cache {
        cache.evict_older_than(opts.cache.max_age());
    }

    let translation = Arc::new(TranslationService::new(
        opts.translator.create_pool()?,
        cache.clone(),
    ));
    let pipeline = Pipeline::new(
        opts.pipeline.to_config(),
        opts.ocr.create_engine(),
        translation,
        Arc::new(BoxFillCompositor::default()),
    );

    // Ctrl-C asks the pipeline to wind down. A second Ctrl-C gets the
    // default behaviour, because we stop listening.
    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing pages already in progress");
                cancel.cancel();
            }
        })
    };

    let shutdown = CancellationToken::new();
    let maintenance = cache.as_ref().map(|cache| {
        cache.spawn_maintenance(
            CACHE_MAINTENANCE_INTERVAL,
            opts.cache.max_age(),
            shutdown.clone(),
        )
    });

    let (tx, rx) = watch::channel(JobSnapshot::default());
    let progress = ui.track_job(rx);
    let report = pipeline
        .run(
            &opts.input,
            opts.translator.language_pair(),
            cancel.clone(),
            tx,
        )
        .await;

    ctrl_c.abort();
    shutdown.cancel();
    if let Some(maintenance) = maintenance {
        maintenance.await.context("cache maintenance task failed")?;
    }
    progress.await.context("progress display failed")?;

    if let Some(path) = &opts.report {
        write_report(path, &report).await?;
    }
    finish(ui, &report, opts.allowed_failure_rate)
}

/// Write per-page results as JSON Lines.
async fn write_report(path: &Path, report: &BatchReport) -> Result<()> {
    let mut writer = JsonlWriter::create(path).await?;
    for result in &report.results {
        writer.write(result).await?;
    }
    writer.finish().await
}

/// Summarize the batch, and turn bad outcomes into an error exit.
fn finish(ui: &Ui, report: &BatchReport, allowed_failure_rate: f32) -> Result<()> {
    match &report.outcome {
        BatchOutcome::Failed { reason } => {
            return Err(anyhow!("batch {} failed: {}", report.job.id, reason));
        }
        BatchOutcome::Cancelled => {
            ui.display_message("🛑", &report.to_string());
            return Err(anyhow!("batch {} was cancelled", report.job.id));
        }
        BatchOutcome::Completed => {}
    }

    let snapshot = &report.snapshot;
    let failure_rate = snapshot.failure_rate();
    if failure_rate > allowed_failure_rate {
        return Err(anyhow!(
            "{}/{} ({:.2}%) of pages failed, but only {:.2}% were allowed",
            snapshot.failed,
            snapshot.total,
            failure_rate * 100.0,
            allowed_failure_rate * 100.0
        ));
    }
    if snapshot.failed > 0 {
        ui.display_message("⚠️", &report.to_string());
    } else {
        ui.display_message("✅", &report.to_string());
    }
    if let Some(output) = &report.job.output {
        ui.display_message("📁", &format!("Output written to {}", output.display()));
    }
    Ok(())
}
