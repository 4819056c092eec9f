//! Configuration types for the add-page pipeline.
//!
//! All behaviour is controlled through [`ArchiveConfig`], built via its
//! [`ArchiveConfigBuilder`]. One struct for every knob means the CLI, tests
//! and embedding applications all configure the pipeline the same way.

use crate::error::ArchiveError;
use crate::pipeline::render::PdfRenderer;
use crate::progress::StageHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Default scratch HTML file name, relative to the work directory.
pub const DEFAULT_HTML_FILE: &str = "_temp.html";

/// Default scratch PDF file name, relative to the work directory.
pub const DEFAULT_PAGE_FILE: &str = "_temp_page.pdf";

/// Configuration for adding pages to an archive.
///
/// # Example
/// ```rust
/// use convo_archiver::ArchiveConfig;
///
/// let config = ArchiveConfig::builder()
///     .show_headings(false)
///     .render_timeout_secs(120)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ArchiveConfig {
    /// Directory holding the scratch HTML and PDF files. Default: `.`.
    pub work_dir: PathBuf,

    /// How scratch file paths are chosen. Default: [`ScratchPolicy::Fixed`].
    pub scratch: ScratchPolicy,

    /// Scratch HTML file name. Default: `_temp.html`.
    pub html_file_name: String,

    /// Scratch single-page PDF file name. Default: `_temp_page.pdf`.
    pub page_file_name: String,

    /// Write the merged archive here instead of replacing the input archive.
    ///
    /// `None` (default) updates the archive in place.
    pub output: Option<PathBuf>,

    /// How the HTML page is built.
    pub page: PageOptions,

    /// How headless Chrome is launched and bounded.
    pub render: RenderOptions,

    /// Custom renderer. Takes precedence over the built-in Chrome renderer.
    pub renderer: Option<Arc<dyn PdfRenderer>>,

    /// Observer for stage transitions.
    pub stage_callback: Option<StageHandle>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            scratch: ScratchPolicy::default(),
            html_file_name: DEFAULT_HTML_FILE.to_string(),
            page_file_name: DEFAULT_PAGE_FILE.to_string(),
            output: None,
            page: PageOptions::default(),
            render: RenderOptions::default(),
            renderer: None,
            stage_callback: None,
        }
    }
}

impl fmt::Debug for ArchiveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveConfig")
            .field("work_dir", &self.work_dir)
            .field("scratch", &self.scratch)
            .field("html_file_name", &self.html_file_name)
            .field("page_file_name", &self.page_file_name)
            .field("output", &self.output)
            .field("page", &self.page)
            .field("render", &self.render)
            .field("renderer", &self.renderer.as_ref().map(|_| "<dyn PdfRenderer>"))
            .field(
                "stage_callback",
                &self.stage_callback.as_ref().map(|_| "<dyn StageCallback>"),
            )
            .finish()
    }
}

impl ArchiveConfig {
    /// Create a new builder for `ArchiveConfig`.
    pub fn builder() -> ArchiveConfigBuilder {
        ArchiveConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ArchiveConfig`].
#[derive(Debug)]
pub struct ArchiveConfigBuilder {
    config: ArchiveConfig,
}

impl ArchiveConfigBuilder {
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = dir.into();
        self
    }

    pub fn scratch(mut self, policy: ScratchPolicy) -> Self {
        self.config.scratch = policy;
        self
    }

    pub fn html_file_name(mut self, name: impl Into<String>) -> Self {
        self.config.html_file_name = name.into();
        self
    }

    pub fn page_file_name(mut self, name: impl Into<String>) -> Self {
        self.config.page_file_name = name.into();
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.output = Some(path.into());
        self
    }

    pub fn page_options(mut self, page: PageOptions) -> Self {
        self.config.page = page;
        self
    }

    pub fn show_headings(mut self, v: bool) -> Self {
        self.config.page.show_headings = v;
        self
    }

    pub fn user_heading(mut self, heading: impl Into<String>) -> Self {
        self.config.page.user_heading = heading.into();
        self
    }

    pub fn model_heading(mut self, heading: impl Into<String>) -> Self {
        self.config.page.model_heading = heading.into();
        self
    }

    pub fn stylesheet(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.page.stylesheet = Some(path.into());
        self
    }

    pub fn web_fonts(mut self, v: bool) -> Self {
        self.config.page.web_fonts = v;
        self
    }

    pub fn math(mut self, v: bool) -> Self {
        self.config.page.math = v;
        self
    }

    pub fn highlight_theme(mut self, theme: impl Into<String>) -> Self {
        self.config.page.highlight_theme = theme.into();
        self
    }

    pub fn chrome_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.render.chrome_path = Some(path.into());
        self
    }

    pub fn sandbox(mut self, v: bool) -> Self {
        self.config.render.sandbox = v;
        self
    }

    pub fn launch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.render.launch_timeout_secs = secs;
        self
    }

    pub fn render_timeout_secs(mut self, secs: u64) -> Self {
        self.config.render.render_timeout_secs = secs;
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn PdfRenderer>) -> Self {
        self.config.renderer = Some(renderer);
        self
    }

    pub fn stage_callback(mut self, cb: StageHandle) -> Self {
        self.config.stage_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ArchiveConfig, ArchiveError> {
        let c = &self.config;
        if c.render.launch_timeout_secs == 0 || c.render.render_timeout_secs == 0 {
            return Err(ArchiveError::InvalidConfig(
                "Launch and render timeouts must be ≥ 1 second".into(),
            ));
        }
        for name in [&c.html_file_name, &c.page_file_name] {
            if name.is_empty() || name.contains(['/', '\\']) {
                return Err(ArchiveError::InvalidConfig(format!(
                    "Scratch file name must be a bare file name, got '{name}'"
                )));
            }
        }
        if c.html_file_name == c.page_file_name {
            return Err(ArchiveError::InvalidConfig(
                "Scratch HTML and PDF file names must differ".into(),
            ));
        }
        Ok(self.config)
    }
}

/// How the pipeline picks scratch file locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScratchPolicy {
    /// Fixed, well-known paths inside the work directory (default).
    ///
    /// Only one job may run at a time; the orchestrator enforces this.
    #[default]
    Fixed,
    /// A fresh temporary directory inside the work directory for every job.
    PerJob,
}

/// Options for building the HTML page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageOptions {
    /// Emit an `<h1>` above each section. Default: true.
    pub show_headings: bool,

    /// Heading above the user message. Default: "User Message".
    pub user_heading: String,

    /// Heading above the model response. Default: "Model Response".
    pub model_heading: String,

    /// Replace the built-in stylesheet with this CSS file.
    pub stylesheet: Option<PathBuf>,

    /// Link Google Fonts (Roboto, Noto Color Emoji). Default: true.
    pub web_fonts: bool,

    /// Load MathJax for `$…$` / `$$…$$` math. Default: true.
    pub math: bool,

    /// syntect theme used for fenced code blocks. Default: "InspiredGitHub".
    pub highlight_theme: String,

    /// Document `<title>`. Default: "Conversation".
    pub title: String,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            show_headings: true,
            user_heading: "User Message".to_string(),
            model_heading: "Model Response".to_string(),
            stylesheet: None,
            web_fonts: true,
            math: true,
            highlight_theme: "InspiredGitHub".to_string(),
            title: "Conversation".to_string(),
        }
    }
}

/// Options for the headless-Chrome renderer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderOptions {
    /// Chrome/Chromium executable. `None` lets `headless_chrome` find one.
    pub chrome_path: Option<PathBuf>,

    /// Keep Chrome's sandbox enabled. Default: true.
    ///
    /// Containers running as root usually need this off.
    pub sandbox: bool,

    /// Upper bound on starting Chrome, in seconds. Default: 30.
    pub launch_timeout_secs: u64,

    /// Upper bound on loading and printing the page, in seconds. Default: 60.
    ///
    /// Covers the network-idle wait for web fonts and MathJax.
    pub render_timeout_secs: u64,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            chrome_path: None,
            sandbox: true,
            launch_timeout_secs: 30,
            render_timeout_secs: 60,
        }
    }
}

impl RenderOptions {
    /// Total bound for one render: launch plus load/print.
    pub fn total_timeout_secs(&self) -> u64 {
        self.launch_timeout_secs + self.render_timeout_secs
    }
}
