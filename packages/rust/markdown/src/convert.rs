//! HTML-to-Markdown conversion.
//!
//! Extracts the main content container, pre-renders tables (htmd 0.1 has no
//! table support), converts with `htmd`, then runs the cleanup passes.
//! Heading levels are kept exactly as authored.

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};

use kbforge_shared::{KbForgeError, Result};

use crate::cleanup;

static TABLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table").expect("valid selector"));
static TR_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("valid selector"));
static TH_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("th").expect("valid selector"));
static TD_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").expect("valid selector"));
static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("valid selector"));

/// Content containers tried in priority order before falling back to `<body>`.
const CONTENT_SELECTORS: &[&str] = &[
    "article .markdown",
    ".vp-doc",
    ".markdown-section",
    "[role=\"main\"]",
    "article",
    "main",
    ".content",
];

/// Convert an HTML document to cleaned Markdown.
#[instrument(skip_all, fields(html_len = html.len()))]
pub fn html_to_markdown(html: &str) -> Result<String> {
    let content_html = extract_content_html(html);
    let content_html = preprocess_tables(&content_html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "nav", "iframe", "noscript", "svg"])
        .build();

    let raw_markdown = converter
        .convert(&content_html)
        .map_err(|e| KbForgeError::Conversion(format!("htmd conversion failed: {e}")))?;

    debug!(raw_len = raw_markdown.len(), "htmd conversion complete");

    Ok(cleanup::tidy(&raw_markdown))
}

/// The document `<title>`, if any.
pub fn html_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    doc.select(&TITLE_SEL)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Replace each `<table>` with a Markdown table ahead of htmd.
fn preprocess_tables(html: &str) -> String {
    let doc = Html::parse_fragment(html);

    if doc.select(&TABLE_SEL).next().is_none() {
        return html.to_string();
    }

    let mut result = html.to_string();
    for table_el in doc.select(&TABLE_SEL) {
        let md_table = html_table_to_markdown(&table_el);
        result = result.replacen(&table_el.html(), &md_table, 1);
    }
    result
}

fn cell_texts(row: &ElementRef, sel: &Selector) -> Vec<String> {
    row.select(sel)
        .map(|cell| cell.text().collect::<String>().trim().to_string())
        .collect()
}

fn html_table_to_markdown(table: &ElementRef) -> String {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut has_header = false;

    for tr in table.select(&TR_SEL) {
        let ths = cell_texts(&tr, &TH_SEL);
        if !ths.is_empty() {
            has_header = true;
            rows.push(ths);
            continue;
        }
        let tds = cell_texts(&tr, &TD_SEL);
        if !tds.is_empty() {
            rows.push(tds);
        }
    }

    let col_count = rows.iter().map(Vec::len).max().unwrap_or(0);
    if col_count == 0 {
        return String::new();
    }
    for row in &mut rows {
        row.resize(col_count, String::new());
    }

    let render_row = |row: &[String]| format!("| {} |\n", row.join(" | "));

    let mut md = String::from("\n\n");
    md.push_str(&render_row(&rows[0]));
    md.push_str(&render_row(&vec!["---".to_string(); col_count]));

    let data_start = usize::from(has_header);
    for row in &rows[data_start..] {
        md.push_str(&render_row(row));
    }
    md.push('\n');
    md
}

/// Main content HTML, stripped of page chrome where a container is found.
fn extract_content_html(html: &str) -> String {
    let doc = Html::parse_document(html);

    for sel_str in CONTENT_SELECTORS {
        if let Ok(selector) = Selector::parse(sel_str) {
            if let Some(el) = doc.select(&selector).next() {
                return el.inner_html();
            }
        }
    }

    if let Ok(body_sel) = Selector::parse("body") {
        if let Some(body) = doc.select(&body_sel).next() {
            return body.inner_html();
        }
    }

    html.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_simple_page() {
        let html = "<html><body><main><h1>Hello World</h1><p>Some text.</p></main></body></html>";
        let md = html_to_markdown(html).unwrap();
        assert!(md.contains("# Hello World"));
        assert!(md.contains("Some text."));
        assert!(md.ends_with('\n'));
    }

    #[test]
    fn strips_nav_and_footer() {
        let html = r#"<html><body>
            <nav><a href="/">Home</a></nav>
            <main><h1>Content</h1><p>Important text.</p></main>
            <footer><p>Copyright 2024</p></footer>
        </body></html>"#;
        let md = html_to_markdown(html).unwrap();
        assert!(md.contains("Important text."));
        assert!(!md.contains("Copyright 2024"));
    }

    #[test]
    fn keeps_every_h1() {
        let html = "<html><body><h1>One</h1><p>a</p><h1>Two</h1><p>b</p></body></html>";
        let md = html_to_markdown(html).unwrap();
        assert!(md.contains("# One"));
        assert!(md.contains("# Two"));
        assert!(!md.contains("## Two"));
    }

    #[test]
    fn renders_tables() {
        let html = r#"<html><body><main>
            <h1>Data</h1>
            <table>
                <thead><tr><th>Name</th><th>Value</th></tr></thead>
                <tbody><tr><td>foo</td><td>bar</td></tr></tbody>
            </table>
        </main></body></html>"#;
        let md = html_to_markdown(html).unwrap();
        assert!(md.contains("| Name | Value |"));
        assert!(md.contains("| foo | bar |"));
    }

    #[test]
    fn preserves_code_blocks() {
        let html = r#"<html><body><main><h1>Code</h1>
            <pre><code class="language-rust">fn main() {}</code></pre>
        </main></body></html>"#;
        let md = html_to_markdown(html).unwrap();
        assert!(md.contains("```rust"));
        assert!(md.contains("fn main() {}"));
    }

    #[test]
    fn reads_document_title() {
        let html = "<html><head><title> Manual </title></head><body></body></html>";
        assert_eq!(html_title(html).as_deref(), Some("Manual"));
        assert!(html_title("<html><body></body></html>").is_none());
    }
}
