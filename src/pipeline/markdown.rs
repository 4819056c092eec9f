//! Markdown → HTML fragment for one conversation section.
//!
//! Parsing and rendering are delegated to `comrak`; fenced code blocks are
//! highlighted with `syntect` using CSS classes, so the colours come from the
//! theme stylesheet embedded by [`crate::pipeline::generate`].
//!
//! Raw HTML in the input is escaped, not passed through: conversation text
//! routinely contains tags that are meant to be read, not rendered. Highlighted
//! blocks are therefore swapped in after formatting, via placeholders that the
//! escaping pass leaves intact.

use crate::error::GenerationError;
use comrak::nodes::{NodeHtmlBlock, NodeValue};
use comrak::{format_html, parse_document, Arena, Options};
use once_cell::sync::Lazy;
use syntect::highlighting::ThemeSet;
use syntect::html::{css_for_theme_with_class_style, ClassStyle, ClassedHTMLGenerator};
use syntect::parsing::{SyntaxReference, SyntaxSet};
use syntect::util::LinesWithEndings;
use tracing::debug;

static SYNTAX_SET: Lazy<SyntaxSet> = Lazy::new(SyntaxSet::load_defaults_newlines);
static THEME_SET: Lazy<ThemeSet> = Lazy::new(ThemeSet::load_defaults);

const CLASS_STYLE: ClassStyle = ClassStyle::SpacedPrefixed { prefix: "syntax-" };

fn markdown_options() -> Options<'static> {
    let mut options = Options::default();

    let ext = &mut options.extension;
    ext.table = true;
    ext.strikethrough = true;
    ext.autolink = true;
    ext.tasklist = true;
    ext.math_dollars = true;

    let render = &mut options.render;
    render.hardbreaks = true;
    render.escape = true;
    render.github_pre_lang = true;

    options
}

/// Render conversation Markdown to an HTML fragment.
pub fn markdown_to_html(text: &str) -> Result<String, GenerationError> {
    let options = markdown_options();
    let arena = Arena::new();
    let root = parse_document(&arena, text, &options);

    let mut blocks: Vec<(String, String)> = Vec::new();
    for node in root.descendants() {
        let code = {
            let data = node.data.borrow();
            match &data.value {
                NodeValue::CodeBlock(block) => {
                    Some((block.info.trim().to_string(), block.literal.clone()))
                }
                _ => None,
            }
        };

        if let Some((info, literal)) = code {
            let language = info.split_whitespace().next();
            let html = highlight_code(language, &literal)?;
            let placeholder = placeholder(blocks.len());
            node.data.borrow_mut().value = NodeValue::HtmlBlock(NodeHtmlBlock {
                block_type: 0,
                literal: placeholder.clone(),
            });
            blocks.push((placeholder, html));
        }
    }

    let mut html = String::new();
    format_html(root, &options, &mut html)
        .map_err(|e| GenerationError::Markdown(e.to_string()))?;

    debug!("Rendered markdown: {} code block(s)", blocks.len());

    Ok(blocks
        .into_iter()
        .fold(html, |acc, (placeholder, block)| acc.replace(&placeholder, &block)))
}

/// CSS for the named syntect theme, scoped to the `syntax-` class prefix.
pub fn theme_css(theme_name: &str) -> Result<String, GenerationError> {
    let theme = THEME_SET
        .themes
        .get(theme_name)
        .ok_or_else(|| GenerationError::Theme(theme_name.to_string()))?;
    css_for_theme_with_class_style(theme, CLASS_STYLE)
        .map_err(|e| GenerationError::Markdown(format!("theme CSS for '{theme_name}': {e}")))
}

/// Names of the bundled highlight themes.
pub fn available_themes() -> Vec<&'static str> {
    THEME_SET.themes.keys().map(String::as_str).collect()
}

// Private-use code points survive comrak's escaping untouched and never occur
// in typed text.
fn placeholder(index: usize) -> String {
    format!("\u{E000}convo-code-{index}\u{E000}")
}

fn highlight_code(language: Option<&str>, code: &str) -> Result<String, GenerationError> {
    let token = language.unwrap_or("text");
    let syntax =
        find_syntax(&SYNTAX_SET, token).unwrap_or_else(|| SYNTAX_SET.find_syntax_plain_text());

    let mut code_with_newline = code.to_string();
    if !code_with_newline.ends_with('\n') {
        code_with_newline.push('\n');
    }

    let mut generator = ClassedHTMLGenerator::new_with_class_style(syntax, &SYNTAX_SET, CLASS_STYLE);
    for line in LinesWithEndings::from(code_with_newline.as_str()) {
        generator
            .parse_html_for_line_which_includes_newline(line)
            .map_err(|e| GenerationError::Markdown(format!("highlighting '{token}': {e}")))?;
    }

    let lang = ammonia::clean_text(&token.to_ascii_lowercase());
    Ok(format!(
        "<pre class=\"codehilite syntax-highlight\" data-language=\"{lang}\"><code class=\"language-{lang}\">{}</code></pre>\n",
        generator.finalize()
    ))
}

fn find_syntax<'a>(syntax_set: &'a SyntaxSet, token: &str) -> Option<&'a SyntaxReference> {
    let lowercase = token.to_ascii_lowercase();
    syntax_set
        .find_syntax_by_token(&lowercase)
        .or_else(|| syntax_set.find_syntax_by_name(token))
        .or_else(|| syntax_set.find_syntax_by_extension(&lowercase))
}
