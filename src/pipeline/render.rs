//! HTML → PDF rendering in headless Chrome.
//!
//! ## Why spawn_blocking?
//!
//! `headless_chrome` speaks CDP over a synchronous websocket and blocks the
//! calling thread for every command. `tokio::task::spawn_blocking` moves the
//! whole browser session onto the blocking pool so the async workers (and the
//! foreground that dispatched the job) stay responsive.
//!
//! ## Browser lifetime
//!
//! One Chrome process per render. The [`Browser`] value owns the child
//! process and kills it on `Drop`, so leaving the blocking scope by any path
//! (success, `?`, panic) tears Chrome down. Every CDP call is bounded by the
//! tab's default timeout, so the scope always ends; the outer
//! `tokio::time::timeout` only decides how long the job waits for it.
//!
//! ## Waiting for fonts
//!
//! `wait_until_navigated` returns once Chrome reports the `networkAlmostIdle`
//! lifecycle event (at most two connections in flight for 500 ms), which is
//! what lets Google Fonts, colour emoji and MathJax arrive before printing.
//! `document.fonts.ready` is awaited on top of that for fonts that finished
//! downloading but are still being decoded.

use crate::config::RenderOptions;
use crate::error::RenderError;
use headless_chrome::types::PrintToPdfOptions;
use headless_chrome::{Browser, LaunchOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// A4 paper width in inches.
pub const A4_WIDTH_IN: f64 = 8.27;
/// A4 paper height in inches.
pub const A4_HEIGHT_IN: f64 = 11.69;

const FONTS_READY: &str = "document.fonts.ready.then(() => document.fonts.status)";

/// Turns an HTML file into PDF bytes.
///
/// Implementations are called from a blocking thread and may block freely.
/// They must release every OS resource they acquire before returning.
pub trait PdfRenderer: Send + Sync {
    fn render(&self, html_path: &Path, options: &RenderOptions) -> Result<Vec<u8>, RenderError>;
}

/// The default renderer: a fresh headless Chrome per page.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChromeRenderer;

impl PdfRenderer for ChromeRenderer {
    fn render(&self, html_path: &Path, options: &RenderOptions) -> Result<Vec<u8>, RenderError> {
        let url = file_url(html_path)?;

        let launch = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(options.sandbox)
            .path(options.chrome_path.clone())
            .idle_browser_timeout(Duration::from_secs(options.total_timeout_secs()))
            .build()
            .map_err(|e| RenderError::Launch(e.to_string()))?;

        let browser = Browser::new(launch).map_err(|e| RenderError::Launch(e.to_string()))?;
        debug!("Chrome launched (pid {:?})", browser.get_process_id());

        let result = print_page(&browser, url.as_str(), options);
        drop(browser);
        debug!("Chrome shut down");
        result
    }
}

fn print_page(browser: &Browser, url: &str, options: &RenderOptions) -> Result<Vec<u8>, RenderError> {
    let timeout_secs = options.render_timeout_secs;

    let tab = browser
        .new_tab()
        .map_err(|e| classify(e, timeout_secs, RenderError::Navigation))?;
    tab.set_default_timeout(Duration::from_secs(timeout_secs));

    tab.navigate_to(url)
        .map_err(|e| classify(e, timeout_secs, RenderError::Navigation))?;
    tab.wait_until_navigated()
        .map_err(|e| classify(e, timeout_secs, RenderError::Navigation))?;

    match tab.evaluate(FONTS_READY, true) {
        Ok(status) => debug!("document.fonts: {:?}", status.value),
        Err(e) => warn!("Could not await document.fonts.ready: {}", e),
    }

    let pdf = tab
        .print_to_pdf(Some(a4_print_options()))
        .map_err(|e| classify(e, timeout_secs, RenderError::Print))?;

    if let Err(e) = tab.close(true) {
        debug!("Closing tab failed (browser is torn down anyway): {}", e);
    }

    Ok(pdf)
}

// headless_chrome reports every failure as an `anyhow::Error`; only the
// message tells a timeout apart from other failures. Its wait helper reports
// an expired deadline as "The event waited for never came".
fn classify(
    e: impl std::fmt::Display,
    timeout_secs: u64,
    otherwise: fn(String) -> RenderError,
) -> RenderError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") || lower.contains("never came") {
        RenderError::Timeout { secs: timeout_secs }
    } else {
        otherwise(msg)
    }
}

/// Print settings: A4, no margins (the stylesheet pads the body), backgrounds on.
pub fn a4_print_options() -> PrintToPdfOptions {
    PrintToPdfOptions {
        landscape: Some(false),
        print_background: Some(true),
        paper_width: Some(A4_WIDTH_IN),
        paper_height: Some(A4_HEIGHT_IN),
        margin_top: Some(0.0),
        margin_bottom: Some(0.0),
        margin_left: Some(0.0),
        margin_right: Some(0.0),
        prefer_css_page_size: Some(false),
        ..Default::default()
    }
}

/// `file://` URL for a local HTML file.
pub fn file_url(path: &Path) -> Result<Url, RenderError> {
    let absolute = path
        .canonicalize()
        .map_err(|_| RenderError::MissingInput {
            path: path.to_path_buf(),
        })?;
    Url::from_file_path(&absolute).map_err(|_| RenderError::MissingInput {
        path: path.to_path_buf(),
    })
}

/// Render `html_path` and write the PDF to `pdf_path`, returning `pdf_path`.
///
/// The render is bounded by `launch_timeout_secs + render_timeout_secs`.
/// The output file is only written once the bytes have been validated and the
/// deadline has not passed, so a timed-out render never leaves a file behind.
pub async fn render_pdf(
    html_path: &Path,
    pdf_path: &Path,
    options: &RenderOptions,
    renderer: Arc<dyn PdfRenderer>,
) -> Result<PathBuf, RenderError> {
    if !html_path.is_file() {
        return Err(RenderError::MissingInput {
            path: html_path.to_path_buf(),
        });
    }

    let secs = options.total_timeout_secs();
    let html = html_path.to_path_buf();
    let opts = options.clone();

    let task = tokio::task::spawn_blocking(move || {
        let bytes = renderer.render(&html, &opts)?;
        let pages = validate_pdf(&bytes)?;
        Ok::<_, RenderError>((bytes, pages))
    });

    let (bytes, pages) = match tokio::time::timeout(Duration::from_secs(secs), task).await {
        Ok(joined) => {
            joined.map_err(|e| RenderError::Internal(format!("Render task panicked: {}", e)))??
        }
        Err(_) => {
            warn!("Render exceeded {}s; abandoning it", secs);
            return Err(RenderError::Timeout { secs });
        }
    };

    if pages > 1 {
        warn!(
            "Rendered page overflowed A4: {} pages will be appended",
            pages
        );
    }

    tokio::fs::write(pdf_path, &bytes)
        .await
        .map_err(|e| RenderError::Io {
            path: pdf_path.to_path_buf(),
            source: e,
        })?;

    info!(
        "Rendered {} → {} ({} bytes, {} page(s))",
        html_path.display(),
        pdf_path.display(),
        bytes.len(),
        pages
    );
    Ok(pdf_path.to_path_buf())
}

/// Check that `bytes` parse as a PDF with at least one page; returns the page count.
pub fn validate_pdf(bytes: &[u8]) -> Result<usize, RenderError> {
    if !bytes.starts_with(b"%PDF") {
        return Err(RenderError::InvalidOutput(
            "output does not start with %PDF".into(),
        ));
    }
    let doc = lopdf::Document::load_mem(bytes)
        .map_err(|e| RenderError::InvalidOutput(e.to_string()))?;
    match doc.get_pages().len() {
        0 => Err(RenderError::InvalidOutput("PDF has no pages".into())),
        n => Ok(n),
    }
}
