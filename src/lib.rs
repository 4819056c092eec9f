//! # convo-archiver
//!
//! Append AI conversation exchanges to a growing PDF archive, one styled A4
//! page per exchange.
//!
//! ## Why a browser?
//!
//! Conversation text is full of things PDF generators handle badly: colour
//! emoji, fenced code, tables, LaTeX. Instead of laying out text ourselves, the
//! exchange is rendered to an HTML page (Markdown, syntax highlighting, web
//! fonts, MathJax) and printed by headless Chrome, exactly as a user would see
//! it. The printed page is then appended to the archive with `lopdf`.
//!
//! ## Pipeline Overview
//!
//! ```text
//! user text + model text
//!  │
//!  ├─ 1. Generate  Markdown → standalone HTML page (scratch .html)
//!  ├─ 2. Render    headless Chrome prints A4 PDF (spawn_blocking, bounded)
//!  ├─ 3. Merge     append page(s) to the archive, atomic replace
//!  └─ 4. Cleanup   scratch files removed on every exit path
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use convo_archiver::{ArchiveConfig, Archiver, PageRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ArchiveConfig::default();
//!     let archiver = Archiver::new("conversations.pdf", config);
//!     let report = archiver
//!         .add_page(PageRequest::new("What is 2 + 2?", "**4**"))
//!         .await?;
//!     println!("{}", report.message());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `convo-archive` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! convo-archiver = { version = "0.1", default-features = false }
//! ```
//!
//! ## Requirements
//!
//! A Chrome or Chromium binary. It is located via `ArchiveConfig`'s
//! `chrome_path`, the `CHROME` environment variable, or the usual install
//! locations, in that order.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod archive;
pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use archive::{add_page_sync, inspect, Archiver};
pub use config::{ArchiveConfig, ArchiveConfigBuilder, PageOptions, RenderOptions, ScratchPolicy};
pub use error::{ArchiveError, GenerationError, MergeError, RenderError};
pub use output::{ArchiveMetadata, JobReport, MergeSummary};
pub use pipeline::generate::{render_html, PageRequest};
pub use pipeline::merge::{inspect_archive, merge_page};
pub use pipeline::render::{render_pdf, ChromeRenderer, PdfRenderer};
pub use progress::{JobStage, NoopStageCallback, StageCallback, StageHandle};
