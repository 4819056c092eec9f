//! Result types returned to the caller.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of a successful add-page job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    /// The archive that now contains the new page.
    pub archive: PathBuf,
    /// `true` when the archive did not exist and was created by this job.
    pub created: bool,
    /// Pages in the archive before the job.
    pub pages_before: usize,
    /// Pages appended by the job (normally 1).
    pub pages_added: usize,
    /// Pages in the archive after the job.
    pub total_pages: usize,
    /// Time spent building the HTML page.
    pub generate_ms: u64,
    /// Time spent in headless Chrome.
    pub render_ms: u64,
    /// Time spent merging and writing the archive.
    pub merge_ms: u64,
    /// Wall-clock time for the whole job.
    pub total_ms: u64,
}

impl JobReport {
    /// Short status line shown to the user.
    pub fn message(&self) -> String {
        if self.created {
            format!(
                "Success! Created {} with {} page(s).",
                self.archive.display(),
                self.total_pages
            )
        } else {
            format!(
                "Success! Page added ({} → {} pages).",
                self.pages_before, self.total_pages
            )
        }
    }
}

/// Page counts produced by the merger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub pages_before: usize,
    pub pages_added: usize,
    pub total_pages: usize,
    pub created: bool,
}

/// Metadata read from an archive without modifying it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub page_count: usize,
    pub pdf_version: String,
    pub is_encrypted: bool,
    pub file_size: u64,
}
