//! Batch job state and progress snapshots.
//!
//! A [`JobTracker`] is owned by exactly one task (the pipeline's
//! aggregator). Everybody else watches [`JobSnapshot`]s through a
//! [`tokio::sync::watch`] channel and never touches the tracker itself.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{prelude::*, scan::ScanResult, translate::LanguagePair};

/// Where a batch job is in its life cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Is this a final state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Can a job move from `self` to `next`?
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What happened to a single page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    /// Translated and written.
    Ok,
    /// Written, but OCR or some translations failed along the way.
    Degraded,
    /// Nothing was written.
    Failed,
    /// Still in flight when the batch was cancelled. Nothing was written.
    Cancelled,
}

impl ImageStatus {
    /// Does this count against the batch's failure tally?
    pub fn is_failure(self) -> bool {
        matches!(self, ImageStatus::Degraded | ImageStatus::Failed)
    }
}

/// One end-to-end run over an input folder.
#[derive(Clone, Debug, Serialize)]
pub struct BatchJob {
    pub id: Uuid,
    pub input: PathBuf,
    /// Known once the input has been validated.
    pub output: Option<PathBuf>,
    pub languages: LanguagePair,
    pub submitted_at: DateTime<Utc>,
}

impl BatchJob {
    pub fn new(input: &Path, languages: LanguagePair) -> Self {
        Self {
            id: Uuid::new_v4(),
            input: input.to_owned(),
            output: None,
            languages,
            submitted_at: Utc::now(),
        }
    }
}

/// Progress through a single chapter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ChapterProgress {
    pub name: String,
    pub done: usize,
    pub total: usize,
}

/// A point-in-time view of a batch job.
#[derive(Clone, Debug, Default, Serialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Chapter of the most recently finished page.
    pub current_chapter: Option<String>,
    /// Per-chapter progress, in reading order.
    pub chapters: Vec<ChapterProgress>,
    pub last_error: Option<String>,
}

impl JobSnapshot {
    /// Progress of the chapter we last heard from.
    pub fn current_chapter_progress(&self) -> Option<&ChapterProgress> {
        let name = self.current_chapter.as_deref()?;
        self.chapters.iter().find(|chapter| chapter.name == name)
    }

    /// Fraction of all pages which failed, or 0 for an empty batch.
    pub fn failure_rate(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f32 / self.total as f32
        }
    }
}

/// The single writer of a job's state.
pub struct JobTracker {
    snapshot: JobSnapshot,
    /// Chapter name to index in `snapshot.chapters`.
    chapter_slots: HashMap<String, usize>,
    /// Which page indices we've already heard about, per chapter.
    seen: Vec<Vec<bool>>,
    tx: watch::Sender<JobSnapshot>,
}

impl JobTracker {
    /// Start tracking `job`, publishing a `Pending` snapshot to `tx`.
    pub fn new(job: &BatchJob, tx: watch::Sender<JobSnapshot>) -> Self {
        let tracker = Self {
            snapshot: JobSnapshot {
                job_id: job.id,
                ..JobSnapshot::default()
            },
            chapter_slots: HashMap::new(),
            seen: vec![],
            tx,
        };
        tracker.publish();
        tracker
    }

    pub fn snapshot(&self) -> &JobSnapshot {
        &self.snapshot
    }

    fn publish(&self) {
        // Nobody may be watching, which is fine.
        self.tx.send_replace(self.snapshot.clone());
    }

    fn set_status(&mut self, next: JobStatus) {
        if !self.snapshot.status.can_transition_to(next) {
            error!(from = %self.snapshot.status, to = %next, "Invalid job status transition");
            return;
        }
        debug!(from = %self.snapshot.status, to = %next, "Job status changed");
        self.snapshot.status = next;
    }

    /// Setup is done and `scan` is about to be queued.
    pub fn start(&mut self, scan: &ScanResult) {
        self.snapshot.total = scan.image_count();
        self.snapshot.chapters = scan
            .chapters
            .iter()
            .map(|chapter| ChapterProgress {
                name: chapter.name.clone(),
                done: 0,
                total: chapter.images.len(),
            })
            .collect();
        self.chapter_slots = scan
            .chapters
            .iter()
            .enumerate()
            .map(|(slot, chapter)| (chapter.name.clone(), slot))
            .collect();
        self.seen = scan
            .chapters
            .iter()
            .map(|chapter| vec![false; chapter.images.len()])
            .collect();
        self.set_status(JobStatus::Processing);
        self.publish();
    }

    /// Record the outcome of page `index` of `chapter`. Pages may arrive in
    /// any order. A page reported twice is ignored.
    pub fn record(
        &mut self,
        chapter: &str,
        index: usize,
        status: ImageStatus,
        error: Option<&str>,
    ) {
        let Some(&slot) = self.chapter_slots.get(chapter) else {
            warn!(chapter, index, "Result for unknown chapter");
            return;
        };
        let Some(seen) = self.seen[slot].get_mut(index) else {
            warn!(chapter, index, "Result for unknown page");
            return;
        };
        if *seen {
            warn!(chapter, index, "Duplicate result for page");
            return;
        }
        *seen = true;

        let snapshot = &mut self.snapshot;
        snapshot.processed += 1;
        snapshot.chapters[slot].done += 1;
        if status == ImageStatus::Cancelled {
            snapshot.cancelled += 1;
        } else if status.is_failure() {
            snapshot.failed += 1;
        } else {
            snapshot.succeeded += 1;
        }
        snapshot.current_chapter = Some(chapter.to_owned());
        if let Some(error) = error {
            snapshot.last_error = Some(error.to_owned());
        }
        self.publish();
    }

    /// Move to a terminal state and publish the final snapshot.
    pub fn finish(mut self, outcome: &BatchOutcome) -> JobSnapshot {
        let status = match outcome {
            BatchOutcome::Completed => JobStatus::Completed,
            BatchOutcome::Failed { reason } => {
                self.snapshot.last_error = Some(reason.clone());
                JobStatus::Failed
            }
            BatchOutcome::Cancelled => JobStatus::Cancelled,
        };
        self.set_status(status);
        self.publish();
        self.snapshot
    }
}

/// How a batch ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Every queued page produced a result. Some may have failed.
    Completed,
    /// Setup failed before any page was queued, or the pipeline broke.
    Failed { reason: String },
    /// Cancelled by the user.
    Cancelled,
}

impl fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchOutcome::Completed => write!(f, "completed"),
            BatchOutcome::Failed { reason } => write!(f, "failed: {reason}"),
            BatchOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{Chapter, FolderKind, ImageFile};

    fn scan_result(chapters: &[(&str, usize)]) -> ScanResult {
        ScanResult {
            kind: FolderKind::Series,
            chapters: chapters
                .iter()
                .map(|(name, count)| Chapter {
                    name: (*name).to_owned(),
                    relative_dir: PathBuf::from(name),
                    images: (0..*count)
                        .map(|index| ImageFile {
                            path: PathBuf::from(format!("/in/{name}/{index}.png")),
                            relative_path: PathBuf::from(format!("{name}/{index}.png")),
                            chapter: (*name).to_owned(),
                            index,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    fn tracker() -> (JobTracker, watch::Receiver<JobSnapshot>) {
        let job = BatchJob::new(Path::new("/in"), LanguagePair::new("ja", "en"));
        let (tx, rx) = watch::channel(JobSnapshot::default());
        (JobTracker::new(&job, tx), rx)
    }

    #[test]
    fn transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(Cancelled.is_terminal());
        assert!(!Processing.is_terminal());
    }

    #[test]
    fn out_of_order_results_are_tallied_by_chapter_and_index() {
        let (mut tracker, rx) = tracker();
        assert_eq!(rx.borrow().status, JobStatus::Pending);

        tracker.start(&scan_result(&[("ch1", 3), ("ch2", 2)]));
        assert_eq!(rx.borrow().status, JobStatus::Processing);
        assert_eq!(rx.borrow().total, 5);

        tracker.record("ch2", 1, ImageStatus::Ok, None);
        tracker.record("ch1", 2, ImageStatus::Ok, None);
        tracker.record("ch1", 0, ImageStatus::Failed, Some("bad page"));
        tracker.record("ch1", 2, ImageStatus::Ok, None);
        tracker.record("ch1", 9, ImageStatus::Ok, None);
        tracker.record("ch9", 0, ImageStatus::Ok, None);

        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.processed, 3);
        assert_eq!(snapshot.succeeded, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.current_chapter.as_deref(), Some("ch1"));
        assert_eq!(snapshot.last_error.as_deref(), Some("bad page"));
        assert_eq!(
            snapshot.chapters,
            vec![
                ChapterProgress {
                    name: "ch1".to_owned(),
                    done: 2,
                    total: 3
                },
                ChapterProgress {
                    name: "ch2".to_owned(),
                    done: 1,
                    total: 2
                },
            ]
        );
        assert_eq!(snapshot.current_chapter_progress().unwrap().done, 2);
    }

    #[test]
    fn cancelled_pages_count_as_neither_success_nor_failure() {
        let (mut tracker, _rx) = tracker();
        tracker.start(&scan_result(&[("ch1", 2)]));
        tracker.record("ch1", 0, ImageStatus::Cancelled, None);
        tracker.record("ch1", 1, ImageStatus::Degraded, Some("ocr failed"));
        let snapshot = tracker.finish(&BatchOutcome::Cancelled);
        assert_eq!(snapshot.status, JobStatus::Cancelled);
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.succeeded, 0);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.cancelled, 1);
    }

    #[test]
    fn setup_failure_goes_straight_from_pending_to_failed() {
        let (tracker, rx) = tracker();
        let snapshot = tracker.finish(&BatchOutcome::Failed {
            reason: "invalid folder structure".to_owned(),
        });
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.last_error.as_deref(), Some("invalid folder structure"));
        assert_eq!(rx.borrow().status, JobStatus::Failed);
    }

    #[test]
    fn failure_rate() {
        let snapshot = JobSnapshot {
            total: 4,
            failed: 1,
            ..JobSnapshot::default()
        };
        assert_eq!(snapshot.failure_rate(), 0.25);
        assert_eq!(JobSnapshot::default().failure_rate(), 0.0);
    }
}
