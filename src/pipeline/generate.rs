//! Page generation: conversation text → standalone HTML document.
//!
//! The document is self-contained apart from two optional network
//! dependencies, Google Fonts and MathJax, which the renderer waits for via
//! Chrome's network-idle signal. Everything else (stylesheet, highlight theme)
//! is inlined so the page renders identically offline.

use crate::config::PageOptions;
use crate::error::GenerationError;
use crate::pipeline::markdown::{markdown_to_html, theme_css};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Built-in stylesheet, used unless [`PageOptions::stylesheet`] is set.
pub const DEFAULT_STYLESHEET: &str = include_str!("../../assets/style.css");

const FONT_LINKS: &str = r#"<link rel="preconnect" href="https://fonts.googleapis.com">
<link rel="preconnect" href="https://fonts.gstatic.com" crossorigin>
<link href="https://fonts.googleapis.com/css2?family=Noto+Color+Emoji&family=Roboto:wght@400;700&display=swap" rel="stylesheet">"#;

// comrak marks math as <span data-math-style="inline|display">; MathJax only
// scans for TeX delimiters, so add them back before typesetting.
const MATHJAX: &str = r#"<script>
window.MathJax = {
  startup: {
    pageReady: () => {
      document.querySelectorAll('[data-math-style]').forEach((el) => {
        const display = el.getAttribute('data-math-style') === 'display';
        el.textContent = (display ? '\\[' : '\\(') + el.textContent + (display ? '\\]' : '\\)');
      });
      return MathJax.startup.defaultPageReady();
    }
  }
};
</script>
<script id="MathJax-script" async src="https://cdn.jsdelivr.net/npm/mathjax@3/es5/tex-mml-chtml.js"></script>"#;

/// The text of one conversation exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// The user's message (Markdown).
    pub user_text: String,
    /// The model's response (Markdown).
    pub model_text: String,
}

impl PageRequest {
    pub fn new(user_text: impl Into<String>, model_text: impl Into<String>) -> Self {
        Self {
            user_text: user_text.into(),
            model_text: model_text.into(),
        }
    }

    /// `true` when both sides are empty or whitespace.
    pub fn is_empty(&self) -> bool {
        self.user_text.trim().is_empty() && self.model_text.trim().is_empty()
    }
}

/// Build the complete HTML document for one page.
pub fn render_html(request: &PageRequest, options: &PageOptions) -> Result<String, GenerationError> {
    if request.is_empty() {
        return Err(GenerationError::EmptyInput);
    }

    let css = load_stylesheet(options)?;
    let highlight_css = theme_css(&options.highlight_theme)?;

    let user_section = render_section(&request.user_text, &options.user_heading, options)?;
    let model_section = render_section(&request.model_text, &options.model_heading, options)?;

    let needs_math = options.math
        && (user_section.contains("data-math-style") || model_section.contains("data-math-style"));

    let mut head = String::new();
    if options.web_fonts {
        head.push_str(FONT_LINKS);
        head.push('\n');
    }
    if needs_math {
        head.push_str(MATHJAX);
        head.push('\n');
    }

    let html = format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\">\n<title>{title}</title>\n{head}<style>\n{css}\n{highlight_css}\n</style>\n</head>\n<body>\n{user_section}{model_section}</body>\n</html>\n",
        title = ammonia::clean_text(&options.title),
    );

    debug!(
        "Generated HTML page: {} bytes (fonts={}, math={})",
        html.len(),
        options.web_fonts,
        needs_math
    );
    Ok(html)
}

/// Write the generated document to the scratch HTML path.
pub async fn write_html(path: &Path, html: &str) -> Result<(), GenerationError> {
    tokio::fs::write(path, html)
        .await
        .map_err(|e| GenerationError::Write {
            path: path.to_path_buf(),
            source: e,
        })
}

fn render_section(
    text: &str,
    heading: &str,
    options: &PageOptions,
) -> Result<String, GenerationError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(String::new());
    }

    let mut section = String::new();
    let heading = heading.trim();
    if options.show_headings && !heading.is_empty() {
        section.push_str(&format!("<h1>{}</h1>\n", ammonia::clean_text(heading)));
    }
    section.push_str(&format!(
        "<div class=\"content\">\n{}</div>\n",
        markdown_to_html(text)?
    ));
    Ok(section)
}

fn load_stylesheet(options: &PageOptions) -> Result<String, GenerationError> {
    match &options.stylesheet {
        Some(path) => std::fs::read_to_string(path).map_err(|e| GenerationError::Stylesheet {
            path: path.clone(),
            source: e,
        }),
        None => Ok(DEFAULT_STYLESHEET.to_string()),
    }
}
