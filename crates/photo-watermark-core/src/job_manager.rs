//! Export orchestration: submission, bounded workers, cancellation and queries

use crate::config::ExportSettings;
use crate::error::{ExportError, Result};
use crate::format_converter::{OutputWriter, DEFAULT_JPEG_QUALITY};
use crate::models::{
    ExportFileResult, ExportPolicy, ExportRequest, JobId, JobSnapshot, SourceFile, WatermarkSpec,
};
use crate::progress::{ExportJob, JobEvent};
use crate::resize::apply_resize;
use crate::storage::StorageRoot;
use crate::utils::{source_file_name, system, time};
use crate::watermark_engine::WatermarkEngine;
use chrono::Utc;
use std::any::Any;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

pub const MSG_NO_FILES: &str = "At least one image must be uploaded";
pub const MSG_NO_EXPORT_CONFIG: &str = "Export configuration must be provided";

const UPDATE_CHANNEL_CAPACITY: usize = 1024;
const EXPLICIT_DIR_PREFIX: &str = "photo-watermark-";
const DEFAULT_EXPORTS_DIR: &str = "exports";

/// How long finished jobs stay in the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Never evict
    #[default]
    KeepAll,
    /// Keep at most `max` terminal jobs; older ones are evicted at submission
    MaxFinished { max: usize },
}

/// Job manager configuration
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    pub max_workers: usize,
    pub retention: RetentionPolicy,
    pub default_jpeg_quality: u8,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            max_workers: system::worker_count(None),
            retention: RetentionPolicy::KeepAll,
            default_jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl JobManagerConfig {
    pub fn from_settings(settings: &ExportSettings) -> Self {
        Self {
            max_workers: system::worker_count(settings.max_concurrent_jobs),
            retention: settings.retention,
            default_jpeg_quality: settings.default_jpeg_quality,
        }
    }
}

/// Accepts export batches and runs each on one worker from a bounded pool
pub struct JobManager {
    config: JobManagerConfig,
    engine: WatermarkEngine,
    storage: Arc<dyn StorageRoot>,
    jobs: Arc<RwLock<HashMap<JobId, Arc<ExportJob>>>>,
    workers: Arc<Semaphore>,
    updates: broadcast::Sender<Arc<JobSnapshot>>,
}

impl JobManager {
    pub fn new(config: JobManagerConfig, engine: WatermarkEngine, storage: Arc<dyn StorageRoot>) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        info!("Job manager initialized with {} workers", config.max_workers);

        Self {
            config,
            engine,
            storage,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            workers,
            updates,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.config.max_workers
    }

    pub fn storage(&self) -> &Arc<dyn StorageRoot> {
        &self.storage
    }

    /// Validate, create the output directory, register the job and dispatch it.
    /// Returns the job's initial QUEUED snapshot.
    pub async fn submit(&self, files: Vec<SourceFile>, request: ExportRequest) -> Result<JobSnapshot> {
        if files.is_empty() {
            return Err(ExportError::invalid_request(MSG_NO_FILES));
        }
        let policy = request
            .export_config
            .ok_or_else(|| ExportError::invalid_request(MSG_NO_EXPORT_CONFIG))?;

        let output_dir = self.resolve_output_directory(policy.output_dir.as_deref())?;
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|source| ExportError::OutputDirectory {
                path: output_dir.clone(),
                source,
            })?;

        let job = Arc::new(ExportJob::new(
            Uuid::new_v4(),
            files.len(),
            output_dir.clone(),
            Some(self.updates.clone()),
        ));
        let snapshot = (*job.snapshot()).clone();

        {
            let mut jobs = self.jobs.write().await;
            evict_finished(&mut jobs, self.config.retention);
            jobs.insert(job.id(), job.clone());
        }

        info!(
            "Export job {} submitted with {} file(s) into {:?}",
            job.id(),
            files.len(),
            output_dir
        );

        let task = ExportTask {
            writer: OutputWriter::new(&output_dir, &policy, self.config.default_jpeg_quality),
            job,
            files,
            watermark: request.watermark_config,
            policy,
            engine: self.engine.clone(),
        };
        self.dispatch(task);

        Ok(snapshot)
    }

    fn dispatch(&self, task: ExportTask) {
        let workers = self.workers.clone();
        tokio::spawn(async move {
            let job = task.job.clone();
            let _permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    if !job.apply(JobEvent::CancellationObserved) {
                        job.apply(JobEvent::Fail("Export service is shutting down".to_string()));
                    }
                    return;
                }
            };

            if let Err(e) = tokio::task::spawn_blocking(move || task.run()).await {
                error!("Export worker for job {} failed: {}", job.id(), e);
                job.apply(JobEvent::Fail(format!("Export worker failed: {}", e)));
            }
        });
    }

    /// Explicit directory: `<abs(dir)>/photo-watermark-<ts>`; otherwise
    /// `<storage>/exports/<ts>`.
    fn resolve_output_directory(&self, configured: Option<&Path>) -> Result<PathBuf> {
        let timestamp = time::export_timestamp(Utc::now());
        match configured.filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => {
                let base = if dir.is_absolute() {
                    dir.to_path_buf()
                } else {
                    std::env::current_dir()?.join(dir)
                };
                Ok(crate::utils::normalize_path(&base).join(format!("{}{}", EXPLICIT_DIR_PREFIX, timestamp)))
            }
            None => self
                .storage
                .resolve(&Path::new(DEFAULT_EXPORTS_DIR).join(timestamp)),
        }
    }

    /// Snapshot of a job, if known
    pub async fn get_status(&self, job_id: JobId) -> Option<JobSnapshot> {
        let jobs = self.jobs.read().await;
        jobs.get(&job_id).map(|job| (*job.snapshot()).clone())
    }

    /// Cancel a non-terminal job. `None` when the job is unknown or already
    /// terminal.
    pub async fn cancel(&self, job_id: JobId) -> Option<JobSnapshot> {
        let job = self.jobs.read().await.get(&job_id).cloned()?;
        if !job.apply(JobEvent::CancelRequested) {
            debug!("Job {} is not cancellable", job_id);
            return None;
        }
        info!("Export job {} cancelled", job_id);
        Some((*job.snapshot()).clone())
    }

    /// All known jobs, newest created first
    pub async fn list(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.read().await;
        let mut snapshots: Vec<JobSnapshot> = jobs.values().map(|job| (*job.snapshot()).clone()).collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }

    /// Stream of snapshots published on every job state change
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<JobSnapshot>> {
        self.updates.subscribe()
    }

    /// Poll until the job reaches a terminal status
    pub async fn wait_for_terminal(&self, job_id: JobId, poll_interval: Duration) -> Option<JobSnapshot> {
        loop {
            let snapshot = self.get_status(job_id).await?;
            if snapshot.is_terminal() {
                return Some(snapshot);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Stop accepting work: queued jobs never start and running jobs are
    /// cancelled at their next file boundary.
    pub async fn shutdown(&self) {
        self.workers.close();
        let jobs = self.jobs.read().await;
        let cancelled = jobs
            .values()
            .filter(|job| job.apply(JobEvent::CancelRequested))
            .count();
        info!("Job manager shut down, {} job(s) cancelled", cancelled);
    }
}

/// Drop the oldest terminal jobs beyond the retention limit
fn evict_finished(jobs: &mut HashMap<JobId, Arc<ExportJob>>, retention: RetentionPolicy) {
    let RetentionPolicy::MaxFinished { max } = retention else {
        return;
    };
    let mut finished: Vec<_> = jobs
        .values()
        .filter(|job| job.is_terminal())
        .map(|job| (job.created_at(), job.id()))
        .collect();
    if finished.len() <= max {
        return;
    }

    finished.sort();
    let excess = finished.len() - max;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
    debug!("Evicted {} finished job(s)", excess);
}

/// Everything one worker needs to process a batch
struct ExportTask {
    job: Arc<ExportJob>,
    files: Vec<SourceFile>,
    watermark: Option<WatermarkSpec>,
    policy: ExportPolicy,
    engine: WatermarkEngine,
    writer: OutputWriter,
}

impl ExportTask {
    /// Process files strictly in order, checking for cancellation between them
    fn run(self) {
        let span = info_span!("export_job", job_id = %self.job.id());
        let _enter = span.enter();

        if !self.job.apply(JobEvent::Start) {
            self.job.apply(JobEvent::CancellationObserved);
            info!("Export job cancelled before it started");
            return;
        }
        info!("Export job started");

        for file in &self.files {
            if self.job.is_cancelled() {
                self.job.apply(JobEvent::CancellationObserved);
                info!("Export job stopped after cancellation");
                return;
            }

            let name = source_file_name(&file.name).to_string();
            self.job.apply(JobEvent::BeginFile(name.clone()));

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process_file(&name, &file.bytes)))
                .unwrap_or_else(|payload| {
                    Err(ExportError::Panicked {
                        name: name.clone(),
                        message: panic_message(payload.as_ref()),
                    })
                });
            let result = match outcome {
                Ok(output_name) => {
                    debug!("Exported {} as {}", name, output_name);
                    ExportFileResult::succeeded(&name, output_name)
                }
                Err(e) => {
                    warn!("Failed to export {} ({}): {}", name, e.error_type(), e);
                    ExportFileResult::failed(&name, e.to_string())
                }
            };
            self.job.apply(JobEvent::FileFinished(result));
        }

        if self.job.apply(JobEvent::Finish) {
            let snapshot = self.job.snapshot();
            info!(
                "Export job completed: {} succeeded, {} failed",
                snapshot.success_count, snapshot.failure_count
            );
        } else {
            self.job.apply(JobEvent::CancellationObserved);
            info!("Export job cancelled after its last file");
        }
    }

    /// decode -> resize -> composite -> encode + write
    fn process_file(&self, name: &str, bytes: &[u8]) -> Result<String> {
        let decoded = image::load_from_memory(bytes).map_err(ExportError::Decode)?;
        let has_alpha = decoded.color().has_alpha();

        let resized = apply_resize(decoded, self.policy.resize.as_ref());
        let mut canvas = resized.into_rgba8();
        self.engine.apply(&mut canvas, self.watermark.as_ref());

        self.writer.write(name, &canvas, has_alpha)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fonts::{EmbeddedFonts, FontCatalog, FontStyle, SystemFontCatalog};
    use crate::models::{JobStatus, TextWatermark};
    use ab_glyph::FontArc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use crate::storage::LocalStorage;
    use tempfile::{tempdir, TempDir};

    fn manager(retention: RetentionPolicy) -> (JobManager, TempDir) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(LocalStorage::with_fallback(None, dir.path().join("storage")));
        let engine = WatermarkEngine::new(SystemFontCatalog::embedded_only().unwrap().into_shared());
        let config = JobManagerConfig {
            max_workers: 2,
            retention,
            default_jpeg_quality: DEFAULT_JPEG_QUALITY,
        };
        (JobManager::new(config, engine, storage), dir)
    }

    fn request(output_dir: Option<PathBuf>) -> ExportRequest {
        ExportRequest {
            watermark_config: None,
            export_config: Some(ExportPolicy {
                output_dir,
                ..Default::default()
            }),
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(8, 8));
        let mut buffer = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buffer, image::ImageFormat::Png).unwrap();
        buffer.into_inner()
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_file_list() {
        let (manager, _dir) = manager(RetentionPolicy::KeepAll);
        let err = manager.submit(Vec::new(), request(None)).await.unwrap_err();
        assert!(err.is_submission_error());
        assert!(err.to_string().contains(MSG_NO_FILES));
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_missing_policy() {
        let (manager, _dir) = manager(RetentionPolicy::KeepAll);
        let files = vec![SourceFile::new("a.png", png_bytes())];
        let err = manager.submit(files, ExportRequest::default()).await.unwrap_err();
        assert!(err.to_string().contains(MSG_NO_EXPORT_CONFIG));
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_output_directory_failure_is_fatal() {
        let (manager, dir) = manager(RetentionPolicy::KeepAll);
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let files = vec![SourceFile::new("a.png", png_bytes())];
        let err = manager.submit(files, request(Some(blocker))).await.unwrap_err();
        assert_eq!(err.error_type(), "output_directory");
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_initial_snapshot_is_queued() {
        let (manager, dir) = manager(RetentionPolicy::KeepAll);
        let files = vec![SourceFile::new("a.png", png_bytes())];
        let snapshot = manager.submit(files, request(Some(dir.path().join("out")))).await.unwrap();

        assert_eq!(snapshot.status, JobStatus::Queued);
        assert_eq!(snapshot.total_files, 1);
        assert_eq!(snapshot.processed_files, 0);
        let out_name = snapshot.output_directory.file_name().unwrap().to_string_lossy().into_owned();
        assert!(out_name.starts_with("photo-watermark-"));
        assert!(!out_name.contains(':'));
        assert_eq!(snapshot.output_directory.parent().unwrap(), dir.path().join("out"));
        assert!(snapshot.output_directory.is_dir());

        let done = manager.wait_for_terminal(snapshot.id, Duration::from_millis(10)).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_default_output_directory_under_storage() {
        let (manager, dir) = manager(RetentionPolicy::KeepAll);
        let files = vec![SourceFile::new("a.png", png_bytes())];
        let snapshot = manager.submit(files, request(None)).await.unwrap();
        assert_eq!(
            snapshot.output_directory.parent().unwrap(),
            dir.path().join("storage").join("exports")
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let (manager, _dir) = manager(RetentionPolicy::KeepAll);
        assert!(manager.cancel(Uuid::new_v4()).await.is_none());
        assert!(manager.get_status(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_retention_evicts_oldest_finished() {
        let (manager, dir) = manager(RetentionPolicy::MaxFinished { max: 1 });
        let mut ids = Vec::new();
        for i in 0..3 {
            let files = vec![SourceFile::new(format!("{}.png", i), png_bytes())];
            let snapshot = manager.submit(files, request(Some(dir.path().join("out")))).await.unwrap();
            manager.wait_for_terminal(snapshot.id, Duration::from_millis(10)).await.unwrap();
            ids.push(snapshot.id);
        }

        // At the third submission two jobs were finished; the oldest was dropped.
        assert!(manager.get_status(ids[0]).await.is_none());
        assert!(manager.get_status(ids[1]).await.is_some());
        assert!(manager.get_status(ids[2]).await.is_some());
    }

    #[test]
    fn test_retention_policy_serialization() {
        let json = serde_json::to_string(&RetentionPolicy::MaxFinished { max: 5 }).unwrap();
        assert_eq!(json, r#"{"mode":"max_finished","max":5}"#);
        let policy: RetentionPolicy = serde_json::from_str(r#"{"mode":"keep_all"}"#).unwrap();
        assert_eq!(policy, RetentionPolicy::KeepAll);
    }

    /// Embedded faces, but the first lookup blows up
    struct FlakyFonts {
        inner: EmbeddedFonts,
        tripped: AtomicBool,
    }

    impl FontCatalog for FlakyFonts {
        fn families(&self) -> Vec<String> {
            Vec::new()
        }

        fn resolve(&self, _family: Option<&str>, style: FontStyle) -> FontArc {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                panic!("font table corrupted");
            }
            self.inner.face(style)
        }
    }

    #[tokio::test]
    async fn test_panicking_file_does_not_abort_batch() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(LocalStorage::with_fallback(None, dir.path().join("storage")));
        let fonts = Arc::new(FlakyFonts {
            inner: EmbeddedFonts::load().unwrap(),
            tripped: AtomicBool::new(false),
        });
        let config = JobManagerConfig {
            max_workers: 1,
            retention: RetentionPolicy::KeepAll,
            default_jpeg_quality: DEFAULT_JPEG_QUALITY,
        };
        let manager = JobManager::new(config, WatermarkEngine::new(fonts), storage);

        let files = vec![
            SourceFile::new("first.png", png_bytes()),
            SourceFile::new("second.png", png_bytes()),
        ];
        let request = ExportRequest {
            watermark_config: Some(WatermarkSpec::text(TextWatermark::new("Hi"))),
            ..request(Some(dir.path().join("out")))
        };
        let snapshot = manager.submit(files, request).await.unwrap();
        let done = manager.wait_for_terminal(snapshot.id, Duration::from_millis(10)).await.unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.processed_files, 2);
        assert_eq!(done.failure_count, 1);
        assert_eq!(done.success_count, 1);
        assert!(!done.results[0].success);
        let message = done.results[0].message.as_deref().unwrap_or_default();
        assert!(message.contains("first.png"));
        assert!(message.contains("font table corrupted"));
        assert_eq!(done.results[1].output_name.as_deref(), Some("second.png"));
        assert!(done.output_directory.join("second.png").is_file());
    }

    #[test]
    fn test_panic_message_payloads() {
        let literal = panic::catch_unwind(|| panic!("static text")).unwrap_err();
        assert_eq!(panic_message(literal.as_ref()), "static text");
        let formatted = panic::catch_unwind(|| panic!("file {}", 7)).unwrap_err();
        assert_eq!(panic_message(formatted.as_ref()), "file 7");
        let opaque = panic::catch_unwind(|| std::panic::panic_any(42u8)).unwrap_err();
        assert_eq!(panic_message(opaque.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_work() {
        let (manager, dir) = manager(RetentionPolicy::KeepAll);
        manager.shutdown().await;

        let files = vec![SourceFile::new("a.png", png_bytes())];
        let snapshot = manager.submit(files, request(Some(dir.path().join("out")))).await.unwrap();
        let done = manager.wait_for_terminal(snapshot.id, Duration::from_millis(10)).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.processed_files, 0);
    }
}
