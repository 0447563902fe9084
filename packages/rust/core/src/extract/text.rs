//! Plain text extractor.
//!
//! Numbered lines that stand alone (`2.1 Scope`, `3. Results`) become
//! id-carrying level-1 headings, so the reconciler can assign their depth.
//! Other lines starting with `#` are escaped so they stay content. Text
//! without any numbered heading is one block keyed by the file name.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use kbforge_markdown::attach_heading_ids;
use kbforge_shared::{KbForgeError, Result};

use super::{Extraction, Extractor, HeadingLevels, SourceFile};

/// Longest line still considered a heading candidate.
const MAX_HEADING_CHARS: usize = 80;

static NUMBERED_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(?:\.\d+)*\.?\s+\S").expect("valid regex"));

pub struct TextExtractor;

#[async_trait]
impl Extractor for TextExtractor {
    fn name(&self) -> &str {
        "text"
    }

    fn suffixes(&self) -> &[&str] {
        &["txt"]
    }

    async fn extract(&self, source: &SourceFile) -> Result<Extraction> {
        let text = tokio::fs::read_to_string(&source.path)
            .await
            .map_err(|e| KbForgeError::extraction(&source.path, e.to_string()))?;

        let (markdown, found_headings) = text_to_markdown(&text);
        if !found_headings {
            return Ok(Extraction::Document {
                markdown,
                levels: HeadingLevels::Reliable,
                reference_toc: Vec::new(),
                synthesize_root: false,
            });
        }
        Ok(Extraction::Document {
            markdown: attach_heading_ids(&markdown),
            levels: HeadingLevels::Flat,
            reference_toc: Vec::new(),
            synthesize_root: true,
        })
    }
}

fn is_heading_candidate(line: &str, prev_blank: bool) -> bool {
    let trimmed = line.trim();
    prev_blank
        && trimmed.chars().count() <= MAX_HEADING_CHARS
        && !trimmed.ends_with(['.', ',', ';', ':'])
        && NUMBERED_HEADING_RE.is_match(trimmed)
}

/// Convert text to Markdown. Returns whether any heading was detected.
fn text_to_markdown(text: &str) -> (String, bool) {
    let mut out = Vec::new();
    let mut prev_blank = true;
    let mut found = false;

    for line in text.lines() {
        if is_heading_candidate(line, prev_blank) {
            out.push(format!("# {}", line.trim()));
            found = true;
        } else if line.starts_with('#') {
            out.push(format!("\\{line}"));
        } else {
            out.push(line.to_string());
        }
        prev_blank = line.trim().is_empty();
    }

    (out.join("\n"), found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbforge_markdown::headings;
    use tempfile::TempDir;

    #[test]
    fn detects_numbered_headings() {
        let text = "Intro line\n\n1. Overview\nbody text.\n\n1.1 Scope\nIn 2024 we grew 3.5 times.\n\n2 Results\nok";
        let (md, found) = text_to_markdown(text);
        assert!(found);
        let hs: Vec<String> = headings(&md).map(|h| h.text).collect();
        assert_eq!(hs, vec!["1. Overview", "1.1 Scope", "2 Results"]);
    }

    #[test]
    fn sentences_are_not_headings() {
        let (md, found) = text_to_markdown("\n3. Then we ran the tests.\n#hashtag\n# not a heading");
        assert!(!found);
        assert!(md.contains("\\# not a heading"));
        assert_eq!(headings(&md).count(), 0);
    }

    #[tokio::test]
    async fn headingless_text_is_not_given_a_root() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("memo.txt");
        std::fs::write(&path, "Meeting moved to Friday.\n# not a heading\n").unwrap();

        let source = SourceFile { path, knowledge_path: "memo.txt".into() };
        match TextExtractor.extract(&source).await.unwrap() {
            Extraction::Document { markdown, levels, synthesize_root, .. } => {
                assert!(!synthesize_root);
                assert_eq!(levels, HeadingLevels::Reliable);
                assert_eq!(headings(&markdown).count(), 0);
            }
            other => panic!("unexpected extraction: {other:?}"),
        }
    }

    #[tokio::test]
    async fn flat_levels_when_headings_found() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manual.txt");
        std::fs::write(&path, "1 Start\nx\n\n1.1 Detail\ny").unwrap();

        let source = SourceFile { path, knowledge_path: "manual.txt".into() };
        match TextExtractor.extract(&source).await.unwrap() {
            Extraction::Document { markdown, levels, .. } => {
                assert_eq!(levels, HeadingLevels::Flat);
                assert!(headings(&markdown).all(|h| h.id.is_some() && h.depth == 1));
            }
            other => panic!("unexpected extraction: {other:?}"),
        }
    }
}
