//! Heading stream parsing and rendering.
//!
//! A heading line is a run of `#` at column 0 followed by whitespace and text.
//! Before reconciliation the text may carry an opaque id suffix `@=@<id>`.

use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use kbforge_shared::HeadingLine;

/// Separator between heading text and its id.
pub const ID_MARKER: &str = "@=@";

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#+)\s+(.*?)\s*$").expect("valid regex"));

/// Parse a single line as a heading. Returns `None` for content lines.
pub fn parse_heading(line: &str) -> Option<HeadingLine> {
    let caps = HEADING_RE.captures(line)?;
    let depth = caps[1].len();
    let raw = &caps[2];

    let (text, id) = match raw.rsplit_once(ID_MARKER) {
        Some((text, id)) if !id.trim().is_empty() => {
            (text.trim().to_string(), Some(id.trim().to_string()))
        }
        _ => (raw.trim().to_string(), None),
    };

    if text.is_empty() && id.is_none() {
        return None;
    }

    Some(HeadingLine { depth, text, id })
}

/// Render a heading back to a Markdown line (without trailing newline).
pub fn render_heading(heading: &HeadingLine) -> String {
    let hashes = "#".repeat(heading.depth.max(1));
    match &heading.id {
        Some(id) => format!("{hashes} {}{ID_MARKER}{id}", heading.text),
        None => format!("{hashes} {}", heading.text),
    }
}

/// Tracks whether the current line sits inside a fenced code region.
#[derive(Debug, Default)]
pub struct FenceTracker {
    in_fence: bool,
}

impl FenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next line. Returns `true` if the line is code (a fence marker
    /// or anything between markers) and must not be parsed as a heading.
    pub fn observe(&mut self, line: &str) -> bool {
        if line.trim_start().starts_with("```") {
            self.in_fence = !self.in_fence;
            return true;
        }
        self.in_fence
    }

    pub fn in_fence(&self) -> bool {
        self.in_fence
    }
}

/// Iterate over the heading lines of a document, skipping fenced code.
pub fn headings(markdown: &str) -> impl Iterator<Item = HeadingLine> + '_ {
    let mut fence = FenceTracker::new();
    markdown.lines().filter_map(move |line| {
        if fence.observe(line) {
            None
        } else {
            parse_heading(line)
        }
    })
}

/// Give every heading lacking an id a fresh UUID v7.
pub fn attach_heading_ids(markdown: &str) -> String {
    let mut fence = FenceTracker::new();
    let mut out: Vec<String> = Vec::new();

    for line in markdown.lines() {
        if fence.observe(line) {
            out.push(line.to_string());
            continue;
        }
        match parse_heading(line) {
            Some(mut heading) if heading.id.is_none() => {
                heading.id = Some(Uuid::now_v7().simple().to_string());
                out.push(render_heading(&heading));
            }
            _ => out.push(line.to_string()),
        }
    }

    out.join("\n")
}

/// Number of level-1 headings outside code fences.
pub fn count_top_level(markdown: &str) -> usize {
    headings(markdown).filter(|h| h.depth == 1).count()
}

/// Whether the first non-blank line of the document is a level-1 heading.
pub fn starts_with_top_level(markdown: &str) -> bool {
    markdown
        .lines()
        .find(|line| !line.trim().is_empty())
        .and_then(parse_heading)
        .is_some_and(|h| h.depth == 1)
}

/// Escape heading and fence markers so embedded text stays body content.
pub fn escape_block_markers(text: &str) -> String {
    text.lines()
        .map(|line| {
            let body = line.trim_start();
            if body.starts_with('#') || body.starts_with("```") {
                let indent = &line[..line.len() - body.len()];
                format!("{indent}\\{body}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_markers_are_escaped() {
        let escaped = escape_block_markers("# Revenue Chart\nBars by quarter\n  ```\nx = #3");
        assert_eq!(escaped, "\\# Revenue Chart\nBars by quarter\n  \\```\nx = #3");
        assert_eq!(headings(&escaped).count(), 0);

        let mut fence = FenceTracker::new();
        assert!(!escaped.lines().any(|line| fence.observe(line)));
    }

    #[test]
    fn parses_plain_heading() {
        let h = parse_heading("## Getting Started").unwrap();
        assert_eq!(h.depth, 2);
        assert_eq!(h.text, "Getting Started");
        assert!(h.id.is_none());
    }

    #[test]
    fn parses_heading_with_id() {
        let h = parse_heading("# Intro@=@abc123").unwrap();
        assert_eq!(h.depth, 1);
        assert_eq!(h.text, "Intro");
        assert_eq!(h.id.as_deref(), Some("abc123"));
    }

    #[test]
    fn rejects_non_headings() {
        assert!(parse_heading("#hashtag").is_none());
        assert!(parse_heading(" # indented").is_none());
        assert!(parse_heading("plain text").is_none());
        assert!(parse_heading("#   ").is_none());
    }

    #[test]
    fn render_roundtrips_id() {
        let h = HeadingLine {
            depth: 3,
            text: "Deep".into(),
            id: Some("x1".into()),
        };
        assert_eq!(render_heading(&h), "### Deep@=@x1");
        assert_eq!(parse_heading(&render_heading(&h)).unwrap(), h);
    }

    #[test]
    fn fence_hides_headings() {
        let md = "# Real\n```\n# not a heading\n```\n## Also Real";
        let texts: Vec<String> = headings(md).map(|h| h.text).collect();
        assert_eq!(texts, vec!["Real", "Also Real"]);
    }

    #[test]
    fn attach_ids_skips_existing_and_code() {
        let md = "# A\n```sh\n# comment\n```\n## B@=@keep";
        let out = attach_heading_ids(md);
        let hs: Vec<HeadingLine> = headings(&out).collect();
        assert_eq!(hs.len(), 2);
        assert!(hs[0].id.is_some());
        assert_eq!(hs[1].id.as_deref(), Some("keep"));
        assert!(out.contains("# comment"));
    }

    #[test]
    fn top_level_helpers() {
        assert_eq!(count_top_level("# A\ntext\n# B\n## C"), 2);
        assert!(starts_with_top_level("\n\n# A\n## B"));
        assert!(!starts_with_top_level("intro\n# A\n## B"));
        assert!(!starts_with_top_level("## B\n# A"));
        assert!(!starts_with_top_level("no headings"));
    }
}
