use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Terminal outcome of a job. Once recorded it never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Default)]
struct JobFields {
    status: String,
    progress: f64,
    speed: String,
    filename: Option<String>,
    final_path: Option<PathBuf>,
    thumbnail_url: Option<String>,
    error: bool,
    completed_at: Option<DateTime<Utc>>,
    outcome: Option<JobOutcome>,
}

/// One requested download, tracked end-to-end with live status.
///
/// Identity and URL are immutable. The display fields are mutated by
/// whichever stage currently owns the job (exactly one task at a time by
/// protocol) and read concurrently by status polling via [`snapshot`].
///
/// [`snapshot`]: DownloadJob::snapshot
#[derive(Debug)]
pub struct DownloadJob {
    id: String,
    url: String,
    created_at: DateTime<Utc>,
    cancelled: AtomicBool,
    cancel: CancellationToken,
    fields: Mutex<JobFields>,
}

impl DownloadJob {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            created_at: Utc::now(),
            cancelled: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            fields: Mutex::new(JobFields {
                status: "Queued".to_string(),
                ..JobFields::default()
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Requests cooperative cancellation. Returns `false` when the job is
    /// already terminal or already cancelling; safe to call repeatedly and
    /// concurrently with status polling.
    pub fn request_cancel(&self) -> bool {
        let mut fields = self.fields.lock().unwrap();
        if fields.completed_at.is_some() || self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        fields.status = "Cancelling...".to_string();
        drop(fields);
        self.cancel.cancel();
        true
    }

    pub fn set_status(&self, status: impl Into<String>) {
        self.fields.lock().unwrap().status = status.into();
    }

    pub fn set_progress(&self, progress: f64) {
        self.fields.lock().unwrap().progress = progress.clamp(0.0, 100.0);
    }

    /// Indeterminate progress pattern for transfers with unknown length:
    /// creeps up in steps of 5 and wraps from 90 back to 10.
    pub fn pulse_progress(&self) {
        let mut fields = self.fields.lock().unwrap();
        fields.progress = if fields.progress >= 90.0 {
            10.0
        } else {
            fields.progress + 5.0
        };
    }

    pub fn set_speed(&self, speed: impl Into<String>) {
        self.fields.lock().unwrap().speed = speed.into();
    }

    pub fn set_filename(&self, filename: impl Into<String>) {
        self.fields.lock().unwrap().filename = Some(filename.into());
    }

    pub fn set_final_path(&self, path: impl AsRef<Path>) {
        self.fields.lock().unwrap().final_path = Some(path.as_ref().to_path_buf());
    }

    pub fn set_thumbnail_url(&self, url: impl Into<String>) {
        self.fields.lock().unwrap().thumbnail_url = Some(url.into());
    }

    pub fn filename(&self) -> Option<String> {
        self.fields.lock().unwrap().filename.clone()
    }

    pub fn final_path(&self) -> Option<PathBuf> {
        self.fields.lock().unwrap().final_path.clone()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.fields.lock().unwrap().completed_at
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        self.fields.lock().unwrap().outcome
    }

    pub fn is_terminal(&self) -> bool {
        self.fields.lock().unwrap().completed_at.is_some()
    }

    /// Records the terminal state. The first writer wins: the completion
    /// timestamp, outcome, status and error flag are written together
    /// exactly once, and later calls are ignored.
    pub fn try_finish(&self, outcome: JobOutcome, status: impl Into<String>) -> bool {
        let mut fields = self.fields.lock().unwrap();
        if fields.completed_at.is_some() {
            return false;
        }
        fields.completed_at = Some(Utc::now());
        fields.outcome = Some(outcome);
        fields.status = status.into();
        fields.error = outcome == JobOutcome::Failed;
        if outcome == JobOutcome::Completed {
            fields.progress = 100.0;
            fields.speed.clear();
        }
        true
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let fields = self.fields.lock().unwrap();
        JobSnapshot {
            id: self.id.clone(),
            url: self.url.clone(),
            status: fields.status.clone(),
            progress: fields.progress,
            speed: fields.speed.clone(),
            filename: fields.filename.clone(),
            final_path: fields.final_path.clone(),
            thumbnail_url: fields.thumbnail_url.clone(),
            error: fields.error,
            cancelled: self.is_cancelled(),
            outcome: fields.outcome,
            created_at: self.created_at,
            completed_at: fields.completed_at,
        }
    }
}

/// Point-in-time copy of a job's display fields, handed to the status
/// surface (UI/API glue).
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub url: String,
    pub status: String,
    pub progress: f64,
    pub speed: String,
    pub filename: Option<String>,
    pub final_path: Option<PathBuf>,
    pub thumbnail_url: Option<String>,
    pub error: bool,
    pub cancelled: bool,
    pub outcome: Option<JobOutcome>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_starts_queued_and_non_terminal() {
        let job = DownloadJob::new("https://example.com/v/1");
        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, "Queued");
        assert!(!job.is_terminal());
        assert!(job.completed_at().is_none());
        assert!(job.outcome().is_none());
    }

    #[test]
    fn terminal_transition_happens_exactly_once() {
        let job = DownloadJob::new("https://example.com/v/1");
        assert!(job.try_finish(JobOutcome::Completed, "Completed"));
        let first = job.completed_at().unwrap();
        assert!(!job.try_finish(JobOutcome::Failed, "Failed: later"));
        assert_eq!(job.completed_at().unwrap(), first);
        assert_eq!(job.outcome(), Some(JobOutcome::Completed));
        assert_eq!(job.snapshot().status, "Completed");
    }

    #[test]
    fn completion_sets_progress_and_clears_speed() {
        let job = DownloadJob::new("https://example.com/v/1");
        job.set_progress(42.0);
        job.set_speed("3.2 MB/s");
        job.try_finish(JobOutcome::Completed, "Completed");
        let snapshot = job.snapshot();
        assert_eq!(snapshot.progress, 100.0);
        assert!(snapshot.speed.is_empty());
        assert!(!snapshot.error);
    }

    #[test]
    fn failure_sets_error_flag_but_cancellation_does_not() {
        let failed = DownloadJob::new("https://example.com/a");
        failed.try_finish(JobOutcome::Failed, "Failed: boom");
        assert!(failed.snapshot().error);

        let cancelled = DownloadJob::new("https://example.com/b");
        cancelled.try_finish(JobOutcome::Cancelled, "Cancelled");
        assert!(!cancelled.snapshot().error);
    }

    #[test]
    fn cancel_flag_is_monotonic_and_idempotent() {
        let job = DownloadJob::new("https://example.com/v/1");
        assert!(job.request_cancel());
        assert!(job.is_cancelled());
        assert!(job.cancel_token().is_cancelled());
        assert_eq!(job.snapshot().status, "Cancelling...");
        // Second request is a no-op.
        assert!(!job.request_cancel());
        assert!(job.is_cancelled());
    }

    #[test]
    fn cancel_after_terminal_is_ignored() {
        let job = DownloadJob::new("https://example.com/v/1");
        job.try_finish(JobOutcome::Completed, "Completed");
        assert!(!job.request_cancel());
        assert_eq!(job.snapshot().status, "Completed");
        assert!(!job.cancel_token().is_cancelled());
    }

    #[test]
    fn pulse_wraps_back_to_ten() {
        let job = DownloadJob::new("https://example.com/v/1");
        job.set_progress(90.0);
        job.pulse_progress();
        assert_eq!(job.snapshot().progress, 10.0);
        job.pulse_progress();
        assert_eq!(job.snapshot().progress, 15.0);
    }
}
