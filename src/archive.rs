//! The add-page orchestrator.
//!
//! An [`Archiver`] owns one archive path and runs jobs against it:
//!
//! ```text
//! Idle ─▶ Generating ─▶ Rendering ─▶ Merging ─▶ CleaningUp ─▶ Done
//!             │             │           │            ▲
//!             └─────────────┴───────────┴─▶ Error ───┘ (cleanup still runs)
//! ```
//!
//! ## Why a gate instead of a queue?
//!
//! The scratch files live at fixed paths, so two jobs in flight would trample
//! each other's HTML and PDF. Rather than queueing, a second submission is
//! rejected immediately with [`ArchiveError::Busy`]; the caller decides
//! whether to retry once the first job finished. The gate is a
//! `tokio::sync::Mutex` taken with `try_lock`, so the check never blocks.
//!
//! The gate belongs to the work directory, not to the `Archiver`: every
//! archiver in the process that shares a work directory shares its gate.
//! With fixed scratch paths a job also holds an advisory lock file in the
//! work directory, which turns away jobs from other processes.

use crate::config::{ArchiveConfig, ScratchPolicy};
use crate::error::{ArchiveError, MergeError};
use crate::output::{ArchiveMetadata, JobReport};
use crate::pipeline::generate::{self, render_html, PageRequest};
use crate::pipeline::merge;
use crate::pipeline::render::{self, ChromeRenderer, PdfRenderer};
use crate::pipeline::scratch::{self, ScratchFiles, ScratchLock};
use crate::progress::{JobStage, NoopStageCallback, StageHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Appends conversation pages to one PDF archive, one job at a time.
pub struct Archiver {
    archive: PathBuf,
    config: ArchiveConfig,
    renderer: Arc<dyn PdfRenderer>,
    callback: StageHandle,
    stage: std::sync::Mutex<JobStage>,
}

// Dropped in field order: the file lock goes before the in-process gate.
struct JobPermit {
    _lock: Option<ScratchLock>,
    _gate: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for Archiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archiver")
            .field("archive", &self.archive)
            .field("config", &self.config)
            .field("stage", &self.stage())
            .finish()
    }
}

impl Archiver {
    /// Create an archiver for `archive`. The file need not exist yet.
    pub fn new(archive: impl Into<PathBuf>, config: ArchiveConfig) -> Self {
        let renderer = config
            .renderer
            .clone()
            .unwrap_or_else(|| Arc::new(ChromeRenderer));
        let callback = config
            .stage_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopStageCallback));
        Self {
            archive: archive.into(),
            config,
            renderer,
            callback,
            stage: std::sync::Mutex::new(JobStage::Idle),
        }
    }

    /// The archive pages are appended to.
    pub fn archive(&self) -> &Path {
        &self.archive
    }

    /// Where merged archives are written: `config.output`, else the archive itself.
    pub fn target(&self) -> &Path {
        self.config.output.as_deref().unwrap_or(&self.archive)
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Stage of the job currently in flight, or `Idle`.
    pub fn stage(&self) -> JobStage {
        *self.stage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `true` while a job in this process holds the work directory's gate.
    pub fn is_busy(&self) -> bool {
        self.gate().try_lock().is_err()
    }

    fn gate(&self) -> Arc<Mutex<()>> {
        scratch::gate_for(&self.config.work_dir)
    }

    fn acquire(&self) -> Result<JobPermit, ArchiveError> {
        let gate = self.gate().try_lock_owned().map_err(|_| ArchiveError::Busy)?;
        let lock = match self.config.scratch {
            ScratchPolicy::Fixed => {
                Some(ScratchLock::try_acquire(&self.config.work_dir)?.ok_or(ArchiveError::Busy)?)
            }
            ScratchPolicy::PerJob => None,
        };
        Ok(JobPermit {
            _lock: lock,
            _gate: gate,
        })
    }

    /// Run one job to completion on the current task.
    ///
    /// # Errors
    /// [`ArchiveError::Busy`] if another job is using the same work directory;
    /// otherwise the error of the stage that failed. The archive is untouched
    /// on error.
    pub async fn add_page(&self, request: PageRequest) -> Result<JobReport, ArchiveError> {
        let _permit = self.acquire()?;
        self.run(request).await
    }

    /// Start a job on a background task and return its handle immediately.
    ///
    /// The busy check happens here, synchronously: if a job is already in
    /// flight no task is spawned and `Err(Busy)` is returned.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_job(
        self: &Arc<Self>,
        request: PageRequest,
    ) -> Result<JoinHandle<Result<JobReport, ArchiveError>>, ArchiveError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ArchiveError::Internal(format!("No tokio runtime: {}", e)))?;
        let permit = self.acquire()?;

        let this = Arc::clone(self);
        Ok(runtime.spawn(async move {
            let _permit = permit;
            this.run(request).await
        }))
    }

    async fn run(&self, request: PageRequest) -> Result<JobReport, ArchiveError> {
        let _idle = IdleOnDrop(self);
        let total_start = Instant::now();
        info!("Adding page to {}", self.archive.display());

        self.enter(JobStage::Generating);
        let mut scratch = match ScratchFiles::prepare(&self.config) {
            Ok(scratch) => scratch,
            Err(e) => return self.fail(JobStage::Generating, e.into()),
        };

        let result = self.run_stages(request, &scratch, total_start).await;

        let failed_stage = self.stage();
        self.enter(JobStage::CleaningUp);
        scratch.cleanup();

        match result {
            Ok(report) => {
                self.enter(JobStage::Done);
                self.callback.on_job_complete(report.total_pages);
                info!("{} ({}ms)", report.message(), report.total_ms);
                Ok(report)
            }
            Err(e) => self.fail(failed_stage, e),
        }
    }

    async fn run_stages(
        &self,
        request: PageRequest,
        scratch: &ScratchFiles,
        total_start: Instant,
    ) -> Result<JobReport, ArchiveError> {
        // ── Generating ───────────────────────────────────────────────────
        let generate_start = Instant::now();
        let page = self.config.page.clone();
        let html = tokio::task::spawn_blocking(move || render_html(&request, &page))
            .await
            .map_err(|e| ArchiveError::Internal(format!("HTML generation task panicked: {}", e)))??;
        generate::write_html(scratch.html_path(), &html).await?;
        let generate_ms = generate_start.elapsed().as_millis() as u64;
        debug!("HTML page written to {}", scratch.html_path().display());

        // ── Rendering ────────────────────────────────────────────────────
        self.enter(JobStage::Rendering);
        let render_start = Instant::now();
        render::render_pdf(
            scratch.html_path(),
            scratch.pdf_path(),
            &self.config.render,
            Arc::clone(&self.renderer),
        )
        .await?;
        let render_ms = render_start.elapsed().as_millis() as u64;

        // ── Merging ──────────────────────────────────────────────────────
        self.enter(JobStage::Merging);
        let merge_start = Instant::now();
        let existing = self.archive.clone();
        let new_page = scratch.pdf_path().to_path_buf();
        let target = self.target().to_path_buf();
        let summary =
            tokio::task::spawn_blocking(move || merge::merge_page(Some(&existing), &new_page, &target))
                .await
                .map_err(|e| MergeError::Internal(e.to_string()))??;
        let merge_ms = merge_start.elapsed().as_millis() as u64;

        Ok(JobReport {
            archive: self.target().to_path_buf(),
            created: summary.created,
            pages_before: summary.pages_before,
            pages_added: summary.pages_added,
            total_pages: summary.total_pages,
            generate_ms,
            render_ms,
            merge_ms,
            total_ms: total_start.elapsed().as_millis() as u64,
        })
    }

    fn enter(&self, stage: JobStage) {
        *self.stage.lock().unwrap_or_else(|e| e.into_inner()) = stage;
        debug!("Job stage: {}", stage);
        self.callback.on_stage(stage);
    }

    fn fail(&self, failed_stage: JobStage, e: ArchiveError) -> Result<JobReport, ArchiveError> {
        self.enter(JobStage::Error);
        let stage = e.stage().unwrap_or(failed_stage);
        error!("Add-page job failed while {}: {}", stage, e);
        self.callback.on_job_error(stage, &e.to_string());
        Err(e)
    }
}

// Returns the archiver to Idle however the job ends, cancellation included.
struct IdleOnDrop<'a>(&'a Archiver);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        *self.0.stage.lock().unwrap_or_else(|e| e.into_inner()) = JobStage::Idle;
    }
}

/// Synchronous wrapper around [`Archiver::add_page`].
///
/// Creates a temporary tokio runtime internally.
pub fn add_page_sync(
    archive: impl Into<PathBuf>,
    request: PageRequest,
    config: ArchiveConfig,
) -> Result<JobReport, ArchiveError> {
    let archiver = Archiver::new(archive, config);
    tokio::runtime::Runtime::new()
        .map_err(|e| ArchiveError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(archiver.add_page(request))
}

/// Read archive metadata without modifying the file.
///
/// Does not launch a browser.
pub async fn inspect(path: impl AsRef<Path>) -> Result<ArchiveMetadata, ArchiveError> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || merge::inspect_archive(&path))
        .await
        .map_err(|e| ArchiveError::Internal(format!("Inspect task panicked: {}", e)))?
        .map_err(ArchiveError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderOptions;
    use crate::error::{GenerationError, RenderError};
    use crate::pipeline::test_support::pdf_with_pages;
    use crate::progress::StageCallback;

    struct FakeRenderer;

    impl PdfRenderer for FakeRenderer {
        fn render(&self, _html: &Path, _options: &RenderOptions) -> Result<Vec<u8>, RenderError> {
            Ok(pdf_with_pages(&["page"]))
        }
    }

    struct BrokenRenderer;

    impl PdfRenderer for BrokenRenderer {
        fn render(&self, _html: &Path, _options: &RenderOptions) -> Result<Vec<u8>, RenderError> {
            Err(RenderError::Print("printer on fire".into()))
        }
    }

    #[derive(Default)]
    struct Recorder {
        stages: std::sync::Mutex<Vec<JobStage>>,
        failed: std::sync::Mutex<Option<JobStage>>,
    }

    impl StageCallback for Recorder {
        fn on_stage(&self, stage: JobStage) {
            self.stages.lock().unwrap().push(stage);
        }

        fn on_job_error(&self, failed_stage: JobStage, _error: &str) {
            *self.failed.lock().unwrap() = Some(failed_stage);
        }
    }

    fn archiver(
        dir: &Path,
        renderer: Arc<dyn PdfRenderer>,
        recorder: Arc<Recorder>,
    ) -> Archiver {
        let config = ArchiveConfig::builder()
            .work_dir(dir)
            .web_fonts(false)
            .renderer(renderer)
            .stage_callback(recorder)
            .build()
            .unwrap();
        Archiver::new(dir.join("archive.pdf"), config)
    }

    fn plain_archiver(dir: &Path) -> Archiver {
        archiver(dir, Arc::new(FakeRenderer), Arc::new(Recorder::default()))
    }

    #[tokio::test]
    async fn stages_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let archiver = archiver(dir.path(), Arc::new(FakeRenderer), recorder.clone());

        let report = archiver
            .add_page(PageRequest::new("Hello", "World"))
            .await
            .unwrap();

        assert!(report.created);
        assert_eq!(
            *recorder.stages.lock().unwrap(),
            vec![
                JobStage::Generating,
                JobStage::Rendering,
                JobStage::Merging,
                JobStage::CleaningUp,
                JobStage::Done,
            ]
        );
        assert_eq!(archiver.stage(), JobStage::Idle);
    }

    #[tokio::test]
    async fn render_failure_reports_stage_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let archiver = archiver(dir.path(), Arc::new(BrokenRenderer), recorder.clone());

        let err = archiver
            .add_page(PageRequest::new("Hello", ""))
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Render(RenderError::Print(_))));
        assert_eq!(*recorder.failed.lock().unwrap(), Some(JobStage::Rendering));
        let stages = recorder.stages.lock().unwrap();
        assert_eq!(stages[stages.len() - 2..], [JobStage::CleaningUp, JobStage::Error]);
        assert!(!dir.path().join("_temp.html").exists());
        assert!(!dir.path().join("archive.pdf").exists());
    }

    #[tokio::test]
    async fn empty_request_fails_in_generation() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let archiver = archiver(dir.path(), Arc::new(FakeRenderer), recorder.clone());

        let err = archiver.add_page(PageRequest::default()).await.unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Generation(GenerationError::EmptyInput)
        ));
        assert_eq!(*recorder.failed.lock().unwrap(), Some(JobStage::Generating));
    }

    #[tokio::test]
    async fn busy_while_gate_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Arc::new(archiver(
            dir.path(),
            Arc::new(FakeRenderer),
            Arc::new(Recorder::default()),
        ));

        let held = archiver.gate().try_lock_owned().unwrap();
        assert!(archiver.is_busy());
        assert!(matches!(
            archiver.add_page(PageRequest::new("a", "b")).await,
            Err(ArchiveError::Busy)
        ));
        assert!(matches!(
            archiver.spawn_job(PageRequest::new("a", "b")),
            Err(ArchiveError::Busy)
        ));

        drop(held);
        let handle = archiver.spawn_job(PageRequest::new("a", "b")).unwrap();
        assert!(handle.await.unwrap().is_ok());
        assert!(!archiver.is_busy());
    }

    #[tokio::test]
    async fn output_path_leaves_archive_alone() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive.pdf");
        let original = pdf_with_pages(&["old"]);
        std::fs::write(&archive, &original).unwrap();
        let out = dir.path().join("copy.pdf");

        let config = ArchiveConfig::builder()
            .work_dir(dir.path())
            .web_fonts(false)
            .output(&out)
            .renderer(Arc::new(FakeRenderer))
            .build()
            .unwrap();
        let report = Archiver::new(&archive, config)
            .add_page(PageRequest::new("new", ""))
            .await
            .unwrap();

        assert_eq!(report.archive, out);
        assert_eq!(report.total_pages, 2);
        assert_eq!(std::fs::read(&archive).unwrap(), original);
    }

    #[tokio::test]
    async fn archivers_sharing_a_work_dir_share_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        let first = plain_archiver(dir.path());
        let second = plain_archiver(dir.path());

        let held = first.gate().try_lock_owned().unwrap();
        assert!(second.is_busy());
        assert!(matches!(
            second.add_page(PageRequest::new("a", "b")).await,
            Err(ArchiveError::Busy)
        ));

        let elsewhere = tempfile::tempdir().unwrap();
        assert!(!plain_archiver(elsewhere.path()).is_busy());

        drop(held);
        assert!(second.add_page(PageRequest::new("a", "b")).await.is_ok());
    }

    #[tokio::test]
    async fn lock_file_held_by_another_process_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = plain_archiver(dir.path());

        let foreign = ScratchLock::try_acquire(dir.path()).unwrap().unwrap();
        assert!(matches!(
            archiver.add_page(PageRequest::new("a", "b")).await,
            Err(ArchiveError::Busy)
        ));
        assert!(!dir.path().join("archive.pdf").exists());

        drop(foreign);
        assert!(archiver.add_page(PageRequest::new("a", "b")).await.is_ok());
    }

    #[tokio::test]
    async fn per_job_scratch_skips_the_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ArchiveConfig::builder()
            .work_dir(dir.path())
            .scratch(ScratchPolicy::PerJob)
            .web_fonts(false)
            .renderer(Arc::new(FakeRenderer))
            .build()
            .unwrap();
        let _foreign = ScratchLock::try_acquire(dir.path()).unwrap().unwrap();

        let report = Archiver::new(dir.path().join("archive.pdf"), config)
            .add_page(PageRequest::new("a", "b"))
            .await
            .unwrap();
        assert_eq!(report.total_pages, 1);
    }

    #[test]
    fn sync_wrapper_respects_shared_gate() {
        let dir = tempfile::tempdir().unwrap();
        let held = scratch::gate_for(dir.path()).try_lock_owned().unwrap();
        let config = ArchiveConfig::builder()
            .work_dir(dir.path())
            .web_fonts(false)
            .renderer(Arc::new(FakeRenderer))
            .build()
            .unwrap();

        let result = add_page_sync(dir.path().join("a.pdf"), PageRequest::new("x", "y"), config);
        assert!(matches!(result, Err(ArchiveError::Busy)));
        drop(held);
    }

    #[test]
    fn spawn_outside_runtime_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Arc::new(archiver(
            dir.path(),
            Arc::new(FakeRenderer),
            Arc::new(Recorder::default()),
        ));
        assert!(matches!(
            archiver.spawn_job(PageRequest::new("a", "")),
            Err(ArchiveError::Internal(_))
        ));
        assert!(!archiver.is_busy());
    }

    #[test]
    fn sync_wrapper_adds_page() {
        let dir = tempfile::tempdir().unwrap();
        let config = ArchiveConfig::builder()
            .work_dir(dir.path())
            .web_fonts(false)
            .renderer(Arc::new(FakeRenderer))
            .build()
            .unwrap();
        let report =
            add_page_sync(dir.path().join("a.pdf"), PageRequest::new("x", "y"), config).unwrap();
        assert_eq!(report.total_pages, 1);
    }

    #[tokio::test]
    async fn inspect_missing_file() {
        assert!(matches!(
            inspect("/definitely/not/here.pdf").await,
            Err(ArchiveError::Merge(MergeError::ArchiveNotFound { .. }))
        ));
    }
}
