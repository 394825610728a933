//! The batch pipeline.
//!
//! We validate and scan the input, then push one [`ImageTask`] per page
//! through a bounded queue to a fixed pool of workers. Workers send a
//! [`ProcessingResult`] per page to a single aggregator, which owns the
//! [`JobTracker`] and publishes a [`JobSnapshot`] after every result.
//!
//! ```text
//! producer --(tasks, bounded)--> worker x N --(results)--> aggregator --> watch
//! ```
//!
//! The queue bound limits how many pages are loaded at once to roughly
//! `queue_capacity + workers`. Cancellation stops the producer and stops
//! workers from taking new tasks. Pages already in flight finish, but
//! their output is discarded rather than written.
//!
//! A panic while processing a page fails that page only. The worker that
//! caught it moves on to the next task.

use std::{any::Any, collections::HashSet, error, fmt, panic::AssertUnwindSafe, sync::Arc};

use clap::Args;
use futures::FutureExt as _;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    async_utils::{JoinWorker, blocking::spawn_blocking_propagating_panics},
    compose::Compositor,
    job::{BatchJob, BatchOutcome, JobSnapshot, JobTracker},
    ocr::OcrEngine,
    prelude::*,
    regions::DEFAULT_OVERLAP_THRESHOLD,
    scan::{self, ScanError, ScanResult, ValidatedInput},
    translate::{LanguagePair, TranslationService},
};

mod worker;

pub use self::worker::{ImageTask, ProcessingResult};
use self::worker::WorkerContext;

/// Default number of pages processed at once.
pub const DEFAULT_WORKERS: usize = 2;

/// Pipeline tuning options.
#[derive(Args, Clone, Debug)]
pub struct PipelineOpts {
    /// How many pages to process at once.
    #[clap(short = 'j', long, default_value_t = DEFAULT_WORKERS)]
    pub jobs: usize,

    /// How many pages may wait in the queue. Defaults to `--jobs`.
    #[clap(long)]
    pub queue_capacity: Option<usize>,

    /// Merge two OCR regions when more than this fraction of the first is
    /// covered by the second.
    #[clap(long, default_value_t = DEFAULT_OVERLAP_THRESHOLD)]
    pub overlap_threshold: f32,
}

impl PipelineOpts {
    pub fn to_config(&self) -> PipelineConfig {
        let workers = self.jobs.max(1);
        PipelineConfig {
            workers,
            queue_capacity: self.queue_capacity.unwrap_or(workers).max(1),
            overlap_threshold: self.overlap_threshold,
        }
    }
}

/// Resolved pipeline settings.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub overlap_threshold: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_WORKERS,
            overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
        }
    }
}

/// Something went wrong before any page was queued.
#[derive(Debug)]
pub enum SetupError {
    /// The input folder can't be processed.
    Input(ScanError),
    /// A setup step failed.
    Step { step: &'static str, message: String },
}

impl SetupError {
    fn step(step: &'static str, err: &anyhow::Error) -> Self {
        SetupError::Step {
            step,
            message: format!("{err:#}"),
        }
    }
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::Input(err) => write!(f, "{err}"),
            SetupError::Step { step, message } => write!(f, "error {step}: {message}"),
        }
    }
}

impl error::Error for SetupError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            SetupError::Input(err) => Some(err),
            SetupError::Step { .. } => None,
        }
    }
}

/// The end of a batch.
#[derive(Debug)]
pub struct BatchReport {
    pub job: BatchJob,
    pub outcome: BatchOutcome,
    /// The final snapshot.
    pub snapshot: JobSnapshot,
    /// Per-page results, in the order they finished.
    pub results: Vec<ProcessingResult>,
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Batch {}: {} ({} pages, {} succeeded, {} failed",
            self.job.id,
            self.outcome,
            self.snapshot.total,
            self.snapshot.succeeded,
            self.snapshot.failed,
        )?;
        if self.snapshot.cancelled > 0 {
            write!(f, ", {} cancelled", self.snapshot.cancelled)?;
        }
        write!(f, ")")
    }
}

/// Runs batches. One pipeline may run any number of batches, one after
/// another, sharing its engines and cache.
pub struct Pipeline {
    config: PipelineConfig,
    ocr: Arc<dyn OcrEngine>,
    translation: Arc<TranslationService>,
    compositor: Arc<dyn Compositor>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        ocr: Arc<dyn OcrEngine>,
        translation: Arc<TranslationService>,
        compositor: Arc<dyn Compositor>,
    ) -> Self {
        Self {
            config,
            ocr,
            translation,
            compositor,
        }
    }

    /// Translate every page under `input`, publishing progress to
    /// `progress`. Always returns a report, even if setup fails.
    #[instrument(level = "debug", skip_all, fields(input = %input.display(), %languages))]
    pub async fn run(
        &self,
        input: &Path,
        languages: LanguagePair,
        cancel: CancellationToken,
        progress: watch::Sender<JobSnapshot>,
    ) -> BatchReport {
        let mut job = BatchJob::new(input, languages);
        let mut tracker = JobTracker::new(&job, progress);
        info!(job_id = %job.id, "Starting batch");

        let (validated, scanned) = match self.setup(input).await {
            Ok(ready) => ready,
            Err(err) => {
                error!("Batch setup failed: {err}");
                let outcome = BatchOutcome::Failed {
                    reason: err.to_string(),
                };
                let snapshot = tracker.finish(&outcome);
                return BatchReport {
                    job,
                    outcome,
                    snapshot,
                    results: vec![],
                };
            }
        };
        job.output = Some(validated.output.clone());
        info!(
            kind = %validated.kind,
            output = %validated.output.display(),
            pages = scanned.image_count(),
            "Input scanned"
        );

        if cancel.is_cancelled() {
            let outcome = BatchOutcome::Cancelled;
            let snapshot = tracker.finish(&outcome);
            return BatchReport {
                job,
                outcome,
                snapshot,
                results: vec![],
            };
        }

        tracker.start(&scanned);
        let (mut tracker, mut results, pipeline_errors) = self
            .process_all(&job, &validated.output, &scanned, tracker, &cancel)
            .await;

        // Internal errors are not a property of the input, so they don't fail
        // the batch. Any page they kept from finishing counts as failed.
        if let Some(err) = pipeline_errors.first() {
            if !cancel.is_cancelled() {
                let reason = format!("page was never processed: {err:#}");
                for result in missing_results(&scanned, &results, &reason) {
                    tracker.record(
                        &result.image.chapter,
                        result.image.index,
                        result.status,
                        Some(reason.as_str()),
                    );
                    results.push(result);
                }
            }
        }

        let snapshot = tracker.snapshot();
        let outcome = if cancel.is_cancelled()
            && (snapshot.processed < snapshot.total || snapshot.cancelled > 0)
        {
            BatchOutcome::Cancelled
        } else {
            BatchOutcome::Completed
        };

        if let Some(cache) = self.translation.cache() {
            cache.save_or_warn().await;
        }

        let snapshot = tracker.finish(&outcome);
        info!(
            job_id = %job.id,
            %outcome,
            processed = snapshot.processed,
            succeeded = snapshot.succeeded,
            failed = snapshot.failed,
            "Batch finished"
        );
        BatchReport {
            job,
            outcome,
            snapshot,
            results,
        }
    }

    /// Validate, scan, check the OCR engine, and create the output tree.
    async fn setup(&self, input: &Path) -> Result<(ValidatedInput, ScanResult), SetupError> {
        let input = input.to_owned();
        let (validated, scanned) = spawn_blocking_propagating_panics(move || {
            let validated = scan::validate(&input).map_err(SetupError::Input)?;
            let scanned = scan::scan(&validated.input)
                .map_err(|err| SetupError::step("scanning input", &err))?;
            Ok::<_, SetupError>((validated, scanned))
        })
        .await?;

        // Before we create anything, so a missing engine leaves no
        // half-made output tree behind.
        self.ocr
            .ensure_ready()
            .await
            .map_err(|err| SetupError::step("checking OCR engine", &err))?;

        let mut dirs = vec![validated.output.clone()];
        dirs.extend(
            scanned
                .chapters
                .iter()
                .map(|chapter| validated.output.join(&chapter.relative_dir)),
        );
        for dir in dirs {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("cannot create {:?}", dir))
                .map_err(|err| SetupError::step("creating output folders", &err))?;
        }
        Ok((validated, scanned))
    }

    /// Run the producer, workers and aggregator until the queue drains or we
    /// are cancelled.
    async fn process_all(
        &self,
        job: &BatchJob,
        output_root: &Path,
        scanned: &ScanResult,
        tracker: JobTracker,
        cancel: &CancellationToken,
    ) -> (JobTracker, Vec<ProcessingResult>, Vec<anyhow::Error>) {
        let tasks = scanned
            .images()
            .map(|image| ImageTask {
                output_path: output_root.join(&image.relative_path),
                image: image.clone(),
            })
            .collect::<Vec<_>>();

        let (task_tx, task_rx) = mpsc::channel::<ImageTask>(self.config.queue_capacity.max(1));
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, result_rx) = mpsc::channel::<ProcessingResult>(self.config.workers.max(1));

        let ctx = Arc::new(WorkerContext {
            ocr: self.ocr.clone(),
            translation: self.translation.clone(),
            compositor: self.compositor.clone(),
            languages: job.languages.clone(),
            overlap_threshold: self.config.overlap_threshold,
        });
        let workers = (0..self.config.workers.max(1))
            .map(|worker_id| {
                JoinWorker::from_handle(tokio::spawn(run_worker(
                    worker_id,
                    ctx.clone(),
                    task_rx.clone(),
                    result_tx.clone(),
                    cancel.clone(),
                )))
            })
            .collect::<Vec<_>>();
        // Workers now hold the only senders, so the results channel closes
        // once they have all exited. Likewise, if every worker dies, the
        // queue closes and the producer stops.
        drop(result_tx);
        drop(task_rx);
        let producer = JoinWorker::from_handle(tokio::spawn(produce(
            tasks,
            task_tx,
            cancel.clone(),
        )));

        let join_all = async move {
            let mut errors = vec![];
            if let Err(err) = producer.join().await {
                error!("Producer failed: {err:#}");
                errors.push(err);
            }
            for worker in workers {
                if let Err(err) = worker.join().await {
                    error!("Worker failed: {err:#}");
                    errors.push(err);
                }
            }
            errors
        };
        let ((tracker, results), errors) = tokio::join!(aggregate(tracker, result_rx), join_all);
        (tracker, results, errors)
    }
}

/// Queue every task, blocking whenever the queue is full.
async fn produce(
    tasks: Vec<ImageTask>,
    tx: mpsc::Sender<ImageTask>,
    cancel: CancellationToken,
) -> Result<()> {
    let total = tasks.len();
    for (queued, task) in tasks.into_iter().enumerate() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(queued, total, "Cancelled, no more pages will be queued");
                break;
            }
            sent = tx.send(task) => {
                if sent.is_err() {
                    // Every worker has stopped.
                    break;
                }
            }
        }
    }
    // Dropping `tx` closes the queue.
    Ok(())
}

/// Take tasks until the queue is closed and drained, or we're cancelled.
async fn run_worker(
    worker_id: usize,
    ctx: Arc<WorkerContext>,
    tasks: Arc<Mutex<mpsc::Receiver<ImageTask>>>,
    results: mpsc::Sender<ProcessingResult>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut count = 0;
    loop {
        let next = {
            let mut tasks = tasks.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                task = tasks.recv() => task,
            }
        };
        let Some(task) = next else { break };
        let image = task.image.clone();
        let result = match AssertUnwindSafe(ctx.process(task, &cancel))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(
                    worker_id,
                    path = %image.path.display(),
                    "Panic while processing page: {message}"
                );
                ProcessingResult::failed(image, format!("panic: {message}"))
            }
        };
        results
            .send(result)
            .await
            .map_err(|_| anyhow!("result channel closed unexpectedly"))?;
        count += 1;
    }
    debug!(worker_id, count, "Worker finished");
    Ok(())
}

/// The message passed to `panic!`, if it was a string.
fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Failed results for every page in `scanned` which has no result yet.
fn missing_results(
    scanned: &ScanResult,
    results: &[ProcessingResult],
    reason: &str,
) -> Vec<ProcessingResult> {
    let seen = results
        .iter()
        .map(|result| (result.image.chapter.as_str(), result.image.index))
        .collect::<HashSet<_>>();
    scanned
        .images()
        .filter(|image| !seen.contains(&(image.chapter.as_str(), image.index)))
        .map(|image| ProcessingResult::failed(image.clone(), reason.to_owned()))
        .collect()
}

/// The single writer of job state. Results may arrive in any order.
async fn aggregate(
    mut tracker: JobTracker,
    mut rx: mpsc::Receiver<ProcessingResult>,
) -> (JobTracker, Vec<ProcessingResult>) {
    let mut results = vec![];
    while let Some(result) = rx.recv().await {
        tracker.record(
            &result.image.chapter,
            result.image.index,
            result.status,
            result.errors.last().map(String::as_str),
        );
        results.push(result);
    }
    (tracker, results)
}
