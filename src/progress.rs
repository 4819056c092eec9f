//! Job stages and the stage-callback trait.
//!
//! Inject an [`Arc<dyn StageCallback>`] via
//! [`crate::config::ArchiveConfigBuilder::stage_callback`] to observe a job
//! as it moves through the pipeline:
//!
//! ```text
//! Idle ─▶ Generating ─▶ Rendering ─▶ Merging ─▶ CleaningUp ─▶ Done
//!             │             │           │
//!             └─────────────┴───────────┴──▶ CleaningUp ─▶ Error
//! ```
//!
//! The callback is the foreground's only view of a background job: the CLI
//! forwards it to a spinner, a GUI would forward it to its event loop.
//!
//! # Example
//!
//! ```rust
//! use convo_archiver::{ArchiveConfig, JobStage, StageCallback};
//! use std::sync::{Arc, Mutex};
//!
//! struct Recorder(Mutex<Vec<JobStage>>);
//!
//! impl StageCallback for Recorder {
//!     fn on_stage(&self, stage: JobStage) {
//!         self.0.lock().unwrap().push(stage);
//!     }
//! }
//!
//! let config = ArchiveConfig::builder()
//!     .stage_callback(Arc::new(Recorder(Mutex::new(Vec::new()))))
//!     .build()
//!     .unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Where a job currently is in the add-page pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStage {
    /// No job in flight.
    Idle,
    /// Building the HTML page.
    Generating,
    /// Headless Chrome is printing the page.
    Rendering,
    /// Appending the page to the archive.
    Merging,
    /// Removing the scratch files.
    CleaningUp,
    /// Terminal: the page was appended.
    Done,
    /// Terminal: the job failed; the archive is unchanged.
    Error,
}

impl JobStage {
    /// `true` for `Done` and `Error`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStage::Done | JobStage::Error)
    }

    /// `true` while a job holds the scratch files.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            JobStage::Generating | JobStage::Rendering | JobStage::Merging | JobStage::CleaningUp
        )
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStage::Idle => "idle",
            JobStage::Generating => "generating page",
            JobStage::Rendering => "rendering PDF",
            JobStage::Merging => "merging into archive",
            JobStage::CleaningUp => "cleaning up",
            JobStage::Done => "done",
            JobStage::Error => "error",
        };
        f.write_str(label)
    }
}

/// Called by the orchestrator as a job changes stage.
///
/// Implementations must be `Send + Sync`: the job runs on a background task
/// while the callback is usually owned by the foreground. All methods have
/// default no-op implementations.
pub trait StageCallback: Send + Sync {
    /// Called on every stage transition, including the terminal one.
    fn on_stage(&self, stage: JobStage) {
        let _ = stage;
    }

    /// Called once when the job reached `Done`.
    ///
    /// # Arguments
    /// * `total_pages` — page count of the archive after the append
    fn on_job_complete(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called once when the job reached `Error`.
    ///
    /// # Arguments
    /// * `failed_stage` — the stage that raised the error
    /// * `error`        — human-readable error description
    fn on_job_error(&self, failed_stage: JobStage, error: &str) {
        let _ = (failed_stage, error);
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopStageCallback;

impl StageCallback for NoopStageCallback {}

/// Convenience alias matching the type stored in [`crate::config::ArchiveConfig`].
pub type StageHandle = Arc<dyn StageCallback>;
