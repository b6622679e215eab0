use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assets::{AssetSink, NullAssetSink};
use crate::config::{load_or_default, SiphonConfig};
use crate::downloader::{BackendTable, MediaDownloader, YtDlpDownloader};
use crate::error::{DownloadError, DownloadResult};
use crate::job::{DownloadJob, JobOutcome, JobSnapshot};
use crate::metadata::MetadataPrefetcher;
use crate::proxy::egress_from_config;

/// Jobs stay visible in the registry this long after finishing, so the
/// status surface can render the final state before the entry is pruned.
const COMPLETION_GRACE: Duration = Duration::from_secs(5);

/// Admission gate. Reconfiguration replaces the whole gate: permits
/// already handed out stay tied to the semaphore they came from, so
/// in-flight transfers are never interrupted by a capacity change.
struct Gate {
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

impl Gate {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }
}

struct ManagerInner {
    config_path: PathBuf,
    download_dir: PathBuf,
    jobs: Mutex<HashMap<String, Arc<DownloadJob>>>,
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
    gate: Mutex<Gate>,
    primary: Arc<dyn MediaDownloader>,
    backends: BackendTable,
    prefetcher: MetadataPrefetcher,
    assets: Arc<dyn AssetSink>,
    primary_attempts: u32,
    primary_delay: Duration,
    grace: Duration,
}

/// Download dispatcher: owns the job registry, the admission gate and the
/// primary/fallback backend routing. Cheap to clone and share.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

pub struct DownloadManagerBuilder {
    config_path: PathBuf,
    config: Option<SiphonConfig>,
    download_dir: Option<PathBuf>,
    primary: Option<Arc<dyn MediaDownloader>>,
    backends: Option<BackendTable>,
    assets: Arc<dyn AssetSink>,
    grace: Duration,
}

impl DownloadManagerBuilder {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            config: None,
            download_dir: None,
            primary: None,
            backends: None,
            assets: Arc::new(NullAssetSink),
            grace: COMPLETION_GRACE,
        }
    }

    /// Use this configuration instead of reading `config_path`. The path
    /// is still what [`DownloadManager::reload_config`] re-reads.
    pub fn config(mut self, config: SiphonConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = Some(dir.into());
        self
    }

    pub fn primary(mut self, primary: Arc<dyn MediaDownloader>) -> Self {
        self.primary = Some(primary);
        self
    }

    pub fn backends(mut self, backends: BackendTable) -> Self {
        self.backends = Some(backends);
        self
    }

    pub fn assets(mut self, assets: Arc<dyn AssetSink>) -> Self {
        self.assets = assets;
        self
    }

    pub fn completion_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn build(self) -> DownloadResult<DownloadManager> {
        let config = self
            .config
            .unwrap_or_else(|| load_or_default(&self.config_path));
        let download_dir = self
            .download_dir
            .unwrap_or_else(|| config.paths.download_dir.clone());
        std::fs::create_dir_all(&download_dir)
            .map_err(|source| DownloadError::io(&download_dir, source))?;

        let egress = egress_from_config(&config.proxy);
        let primary = match self.primary {
            Some(primary) => primary,
            None => Arc::new(YtDlpDownloader::new(&config.download, egress.clone())),
        };
        let backends = match self.backends {
            Some(backends) => backends,
            None => BackendTable::standard(&config, egress.clone())?,
        };
        let prefetcher = MetadataPrefetcher::new(&config.download, egress);
        let capacity = config.limits.capacity();
        info!(
            capacity,
            dir = %download_dir.display(),
            "download manager ready"
        );

        Ok(DownloadManager {
            inner: Arc::new(ManagerInner {
                config_path: self.config_path,
                download_dir,
                jobs: Mutex::new(HashMap::new()),
                handles: Mutex::new(HashMap::new()),
                gate: Mutex::new(Gate::new(capacity)),
                primary,
                backends,
                prefetcher,
                assets: self.assets,
                primary_attempts: config.download.max_attempts.max(1),
                primary_delay: Duration::from_secs(config.download.retry_delay_seconds),
                grace: self.grace,
            }),
        })
    }
}

impl DownloadManager {
    pub fn builder(config_path: impl Into<PathBuf>) -> DownloadManagerBuilder {
        DownloadManagerBuilder::new(config_path)
    }

    pub fn download_dir(&self) -> &std::path::Path {
        &self.inner.download_dir
    }

    /// Queues a download and returns its job id. The job starts waiting
    /// on the admission gate immediately.
    pub fn submit(&self, url: &str) -> DownloadResult<String> {
        let url = url.trim();
        if url.is_empty() {
            return Err(DownloadError::Backend("cannot queue an empty URL".into()));
        }
        let job = Arc::new(DownloadJob::new(url));
        let id = job.id().to_string();
        self.inner
            .jobs
            .lock()
            .unwrap()
            .insert(id.clone(), Arc::clone(&job));

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(process(inner, Arc::clone(&job)));
        self.inner.handles.lock().unwrap().insert(id.clone(), handle);
        info!(job = %id, url, "download queued");
        Ok(id)
    }

    /// Snapshots every registered job, oldest first, pruning entries that
    /// finished longer than the completion grace ago.
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.inner.grace).unwrap_or(chrono::Duration::zero());
        let mut pruned = Vec::new();
        let mut snapshots: Vec<JobSnapshot> = {
            let mut jobs = self.inner.jobs.lock().unwrap();
            jobs.retain(|id, job| {
                let keep = match job.completed_at() {
                    Some(completed_at) => completed_at > cutoff,
                    None => true,
                };
                if !keep {
                    pruned.push(id.clone());
                }
                keep
            });
            jobs.values().map(|job| job.snapshot()).collect()
        };
        if !pruned.is_empty() {
            let mut handles = self.inner.handles.lock().unwrap();
            for id in &pruned {
                handles.remove(id);
            }
            debug!(count = pruned.len(), "pruned finished jobs");
        }
        snapshots.sort_by_key(|snapshot| snapshot.created_at);
        snapshots
    }

    pub fn job(&self, id: &str) -> Option<JobSnapshot> {
        let jobs = self.inner.jobs.lock().unwrap();
        jobs.get(id).map(|job| job.snapshot())
    }

    /// Requests cancellation of a job. Returns `false` for unknown ids
    /// and for jobs that already finished.
    pub fn cancel(&self, id: &str) -> bool {
        let job = {
            let jobs = self.inner.jobs.lock().unwrap();
            jobs.get(id).cloned()
        };
        match job {
            Some(job) => {
                let requested = job.request_cancel();
                if requested {
                    info!(job = %id, "cancellation requested");
                }
                requested
            }
            None => false,
        }
    }

    /// Re-reads the config file and applies a changed concurrency limit
    /// by swapping in a fresh admission gate. Slots already granted are
    /// unaffected; only future admissions see the new capacity.
    pub fn reload_config(&self) -> usize {
        let config = load_or_default(&self.inner.config_path);
        let capacity = config.limits.capacity();
        let mut gate = self.inner.gate.lock().unwrap();
        if gate.capacity != capacity {
            info!(old = gate.capacity, new = capacity, "admission gate resized");
            *gate = Gate::new(capacity);
        }
        capacity
    }

    pub fn capacity(&self) -> usize {
        self.inner.gate.lock().unwrap().capacity
    }

    /// Cancels everything and waits for all job tasks to settle.
    pub async fn shutdown(&self) {
        let jobs: Vec<Arc<DownloadJob>> = {
            let jobs = self.inner.jobs.lock().unwrap();
            jobs.values().cloned().collect()
        };
        for job in jobs {
            job.request_cancel();
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut handles = self.inner.handles.lock().unwrap();
            handles.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "job task panicked during shutdown");
                }
            }
        }
        info!("download manager shut down");
    }
}

/// Full lifecycle of one job: gate admission, pipeline, terminal state
/// and cleanup. Holds the admission permit for the whole transfer.
async fn process(inner: Arc<ManagerInner>, job: Arc<DownloadJob>) {
    job.set_status("Waiting for slot...");
    // The permit must come from the gate as it was at admission time, so
    // a later gate swap cannot absorb or double-count this release.
    let semaphore = {
        let gate = inner.gate.lock().unwrap();
        Arc::clone(&gate.semaphore)
    };
    let cancel = job.cancel_token();

    let permit = tokio::select! {
        _ = cancel.cancelled() => {
            finalize(&inner, &job, Err(DownloadError::Cancelled)).await;
            return;
        }
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                finalize(&inner, &job, Err(DownloadError::Cancelled)).await;
                return;
            }
        },
    };

    let result = run_pipeline(&inner, &job, &cancel).await;
    finalize(&inner, &job, result).await;
    drop(permit);
}

async fn run_pipeline(
    inner: &ManagerInner,
    job: &DownloadJob,
    cancel: &CancellationToken,
) -> DownloadResult<PathBuf> {
    if cancel.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }
    inner.prefetcher.prefetch(job, cancel).await;
    if cancel.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }

    match run_primary(inner, job, cancel).await {
        Ok(path) => return Ok(path),
        Err(err) if err.is_cancelled() => return Err(err),
        Err(err) => {
            warn!(url = %job.url(), error = %err, "extractor exhausted, falling back");
        }
    }

    job.set_status("Extractor failed. Reverting to scraper...");
    tokio::select! {
        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        _ = sleep(Duration::from_secs(1)) => {}
    }

    let backend = inner.backends.select(job.url());
    debug!(url = %job.url(), backend = backend.name(), "fallback backend selected");
    backend
        .fetch(&inner.download_dir, job.url(), job, cancel)
        .await
}

async fn run_primary(
    inner: &ManagerInner,
    job: &DownloadJob,
    cancel: &CancellationToken,
) -> DownloadResult<PathBuf> {
    let mut last_error = DownloadError::Backend("extractor made no attempts".to_string());
    for attempt in 1..=inner.primary_attempts {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        job.set_status(format!(
            "Extractor attempt {attempt}/{}...",
            inner.primary_attempts
        ));
        match inner
            .primary
            .fetch(&inner.download_dir, job.url(), job, cancel)
            .await
        {
            Ok(path) => return Ok(path),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                warn!(url = %job.url(), attempt, error = %err, "extractor attempt failed");
                last_error = err;
            }
        }
        if attempt < inner.primary_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = sleep(inner.primary_delay) => {}
            }
        }
    }
    Err(last_error)
}

/// Records the terminal state exactly once and runs the matching side
/// effects. Completion notifies the asset sink only for the winning
/// terminal transition and only when a real file exists.
async fn finalize(inner: &ManagerInner, job: &DownloadJob, result: DownloadResult<PathBuf>) {
    match result {
        Ok(path) => {
            job.set_final_path(&path);
            if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                job.set_filename(name.trim_end_matches(".mp4"));
            }
            if job.try_finish(JobOutcome::Completed, "Completed") {
                let usable = tokio::fs::metadata(&path)
                    .await
                    .map(|meta| meta.len() > 0)
                    .unwrap_or(false);
                if usable {
                    inner.assets.queue_generation(&path);
                } else {
                    warn!(path = %path.display(), "completed job left no usable file");
                }
            }
            info!(job = %job.id(), path = %path.display(), "download completed");
        }
        Err(err) if err.is_cancelled() => {
            cleanup_job(inner, job).await;
            job.try_finish(JobOutcome::Cancelled, "Cancelled");
            inner.assets.purge_previews(job.id());
            info!(job = %job.id(), "download cancelled");
        }
        Err(err) => {
            job.try_finish(JobOutcome::Failed, format!("Failed: {err}"));
            cleanup_job(inner, job).await;
            warn!(job = %job.id(), error = %err, "download failed");
        }
    }
}

/// Removes whatever the job left on disk. Best effort and idempotent;
/// backends already clean their own temp files on most error paths.
async fn cleanup_job(inner: &ManagerInner, job: &DownloadJob) {
    if let Some(path) = job.final_path() {
        if tokio::fs::remove_file(&path).await.is_ok() {
            debug!(path = %path.display(), "removed incomplete download");
        }
    }
    let Some(stem) = job.filename() else { return };
    let Ok(mut entries) = tokio::fs::read_dir(&inner.download_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.ends_with(".part") && name.contains(&stem) {
            if tokio::fs::remove_file(entry.path()).await.is_ok() {
                debug!(file = name, "removed orphaned partial file");
            }
        }
    }
}
