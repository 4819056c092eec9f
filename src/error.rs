//! Error types for the convo-archiver library.
//!
//! Each pipeline stage owns one error enum so the failing stage is visible in
//! the type, and all three fold into the fatal [`ArchiveError`] returned by
//! [`crate::archive::Archiver::add_page`]:
//!
//! * [`GenerationError`] — the HTML page could not be built (empty input,
//!   unreadable stylesheet, Markdown/highlighting failure).
//! * [`RenderError`] — headless Chrome could not turn the HTML into a PDF
//!   (launch, navigation, print, timeout, invalid output).
//! * [`MergeError`] — the new page could not be appended to the archive
//!   (corrupt archive, invalid page, write failure). The archive on disk is
//!   never modified when this is returned.
//!
//! None of them are retried: a job that fails is terminal and the caller
//! decides whether to submit it again.

use crate::progress::JobStage;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the convo-archiver library.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Building the HTML page failed.
    #[error(transparent)]
    Generation(#[from] GenerationError),

    /// Rendering the HTML page to PDF failed.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// Appending the rendered page to the archive failed.
    #[error(transparent)]
    Merge(#[from] MergeError),

    /// Another job is already in flight on this archiver.
    ///
    /// The scratch files live at fixed paths, so two concurrent jobs would
    /// overwrite each other's intermediate state.
    #[error("An add-page job is already running; wait for it to finish before submitting another")]
    Busy,

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal error (task panicked, runtime unavailable, …).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ArchiveError {
    /// The pipeline stage this error was raised in, if it came from one.
    pub fn stage(&self) -> Option<JobStage> {
        match self {
            ArchiveError::Generation(_) => Some(JobStage::Generating),
            ArchiveError::Render(_) => Some(JobStage::Rendering),
            ArchiveError::Merge(_) => Some(JobStage::Merging),
            _ => None,
        }
    }
}

/// Failure while building the HTML document for a page.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Both the user message and the model response were empty.
    #[error("Both text boxes are empty; nothing to add")]
    EmptyInput,

    /// The custom stylesheet could not be read.
    #[error("Failed to read stylesheet '{path}': {source}")]
    Stylesheet {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The requested syntax-highlighting theme is not bundled.
    #[error("Unknown highlight theme '{0}'")]
    Theme(String),

    /// Markdown formatting or code highlighting failed.
    #[error("Markdown rendering failed: {0}")]
    Markdown(String),

    /// The generated HTML could not be written to the scratch path.
    #[error("Failed to write HTML to '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure while rendering HTML to PDF in headless Chrome.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The HTML input file does not exist or cannot be read.
    #[error("HTML input not found: '{path}'")]
    MissingInput { path: PathBuf },

    /// Chrome could not be started.
    #[error(
        "Failed to launch headless Chrome: {0}\n\
Install Chrome/Chromium or point --chrome (CHROME env) at the executable."
    )]
    Launch(String),

    /// The page could not be opened or never finished loading.
    #[error("Failed to load page in Chrome: {0}")]
    Navigation(String),

    /// Chrome failed to print the loaded page.
    #[error("Chrome failed to print PDF: {0}")]
    Print(String),

    /// Launch plus rendering exceeded the configured bound.
    #[error("Rendering timed out after {secs}s\nIncrease --render-timeout or check network access for web fonts.")]
    Timeout { secs: u64 },

    /// Chrome returned bytes that are not a usable PDF.
    #[error("Renderer produced an invalid PDF: {0}")]
    InvalidOutput(String),

    /// The rendered PDF could not be written.
    #[error("Failed to write rendered PDF '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The render task panicked or was cancelled.
    #[error("Render task failed: {0}")]
    Internal(String),
}

/// Failure while appending a page to the archive.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The archive to inspect does not exist.
    #[error("Archive not found: '{path}'")]
    ArchiveNotFound { path: PathBuf },

    /// The existing archive does not start with the `%PDF` magic.
    #[error("Archive is not a PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// The existing archive could not be parsed.
    #[error("Archive '{path}' is corrupt: {detail}\nThe file was left untouched.")]
    CorruptArchive { path: PathBuf, detail: String },

    /// Encrypted archives cannot be appended to.
    #[error("Archive '{path}' is encrypted; decrypt it first (e.g. qpdf --decrypt)")]
    EncryptedArchive { path: PathBuf },

    /// The rendered page file is missing.
    #[error("Rendered page not found: '{path}'")]
    MissingPage { path: PathBuf },

    /// The rendered page could not be parsed.
    #[error("Rendered page '{path}' is not a valid PDF: {detail}")]
    InvalidPage { path: PathBuf, detail: String },

    /// The rendered page parsed but contains no pages.
    #[error("Rendered page '{path}' contains no pages")]
    EmptyPage { path: PathBuf },

    /// Writing the merged archive failed.
    #[error("Failed to write archive '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The merge task panicked.
    #[error("Merge task failed: {0}")]
    Internal(String),
}
