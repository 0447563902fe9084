//! Format extractors and the registry that picks one per source file.
//!
//! The registry is built explicitly at startup and handed to the pipeline.
//! Selection order: hidden/temporary names, ignore patterns, extractor
//! patterns, then file suffix.

mod html;
mod image;
mod markdown;
mod text;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use kbforge_shared::{KbForgeError, Result, TocItem};

use crate::response::PageDescription;

pub use html::HtmlExtractor;
pub use image::{ImageDescriber, ImageExtractor};
pub use markdown::MarkdownExtractor;
pub use text::TextExtractor;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// How far heading depths in an extracted document can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadingLevels {
    /// Depths are authored; feed straight to the section builder.
    Reliable,
    /// Headings carry ids at depth 1 and need reconciliation first.
    Flat,
}

/// What an extractor produced for one file.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Document {
        markdown: String,
        levels: HeadingLevels,
        /// The format's own outline, if it has one.
        reference_toc: Vec<TocItem>,
        /// Synthesize a root heading from the file stem when missing.
        synthesize_root: bool,
    },
    /// Ordered page or image analyses.
    Pages(Vec<PageDescription>),
}

impl Extraction {
    /// A Markdown document with authored heading levels.
    pub fn document(markdown: impl Into<String>) -> Self {
        Self::Document {
            markdown: markdown.into(),
            levels: HeadingLevels::Reliable,
            reference_toc: Vec::new(),
            synthesize_root: true,
        }
    }
}

/// A source file handed to an extractor.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Absolute (or caller-relative) path used for reading.
    pub path: PathBuf,
    /// Path relative to the source root, `/`-separated.
    pub knowledge_path: String,
}

impl SourceFile {
    /// The source root, recovered by walking up one level per component of
    /// the knowledge path.
    pub fn source_root(&self) -> &Path {
        let depth = self.knowledge_path.split('/').filter(|c| !c.is_empty()).count();
        self.path
            .ancestors()
            .nth(depth.max(1))
            .unwrap_or_else(|| Path::new("."))
    }
}

/// Turns one file format into a heading stream or page descriptions.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Human-readable name for tracing.
    fn name(&self) -> &str;

    /// Lowercase suffixes (without the dot) this extractor claims.
    fn suffixes(&self) -> &[&str];

    /// Optional path pattern that takes precedence over suffix matching.
    fn pattern(&self) -> Option<&Regex> {
        None
    }

    async fn extract(&self, source: &SourceFile) -> Result<Extraction>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Outcome of looking up a path.
pub enum Selection {
    Extractor(Arc<dyn Extractor>),
    Ignored,
    Unsupported,
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Extractor(e) => write!(f, "Extractor({})", e.name()),
            Self::Ignored => f.write_str("Ignored"),
            Self::Unsupported => f.write_str("Unsupported"),
        }
    }
}

/// Explicit table of extractors plus path ignore rules.
#[derive(Default)]
pub struct ExtractorRegistry {
    patterned: Vec<Arc<dyn Extractor>>,
    by_suffix: HashMap<String, Arc<dyn Extractor>>,
    ignore: Vec<Regex>,
}

impl ExtractorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in extractors. Image extraction and inline
    /// image descriptions are only available with a describer.
    pub fn builtin(describer: Option<Arc<ImageDescriber>>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MarkdownExtractor::new(describer.clone())));
        registry.register(Arc::new(TextExtractor));
        registry.register(Arc::new(HtmlExtractor));
        if let Some(describer) = describer {
            registry.register(Arc::new(ImageExtractor::new(describer)));
        }
        registry
    }

    /// Add an extractor. A suffix already claimed keeps its first owner.
    pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
        if extractor.pattern().is_some() {
            self.patterned.push(Arc::clone(&extractor));
        }
        for suffix in extractor.suffixes() {
            let key = suffix.to_lowercase();
            if let Some(existing) = self.by_suffix.get(&key) {
                warn!(
                    suffix = %key,
                    existing = existing.name(),
                    ignored = extractor.name(),
                    "suffix already has an extractor"
                );
                continue;
            }
            self.by_suffix.insert(key, Arc::clone(&extractor));
        }
    }

    /// Add ignore patterns, matched anywhere in the relative path.
    pub fn with_ignore_patterns(mut self, patterns: Vec<Regex>) -> Self {
        self.ignore.extend(patterns);
        self
    }

    /// Names of registered extractors in suffix order, for display.
    pub fn describe(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .by_suffix
            .iter()
            .map(|(suffix, e)| (suffix.clone(), e.name().to_string()))
            .collect();
        out.sort();
        out
    }

    /// Choose how to handle `knowledge_path` (relative, `/`-separated).
    pub fn select(&self, knowledge_path: &str) -> Selection {
        let file_name = knowledge_path.rsplit('/').next().unwrap_or(knowledge_path);
        if file_name.starts_with('.') || file_name.starts_with('~') {
            return Selection::Ignored;
        }

        if let Some(re) = self.ignore.iter().find(|re| re.is_match(knowledge_path)) {
            debug!(path = %knowledge_path, pattern = %re, "path ignored");
            return Selection::Ignored;
        }

        for extractor in &self.patterned {
            if extractor.pattern().is_some_and(|re| re.is_match(knowledge_path)) {
                return Selection::Extractor(Arc::clone(extractor));
            }
        }

        let suffix = match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
            _ => return Selection::Unsupported,
        };
        match self.by_suffix.get(&suffix) {
            Some(extractor) => Selection::Extractor(Arc::clone(extractor)),
            None => Selection::Unsupported,
        }
    }
}

/// Parse ignore-file content: one regex per line; blank lines and lines
/// starting with `#`, `;`, or `//` are skipped.
pub fn parse_ignore_patterns(content: &str) -> Result<Vec<Regex>> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !(line.starts_with('#') || line.starts_with(';') || line.starts_with("//")))
        .map(|line| {
            Regex::new(line)
                .map_err(|e| KbForgeError::config(format!("invalid ignore pattern '{line}': {e}")))
        })
        .collect()
}

/// Read ignore patterns from a file. A missing file yields no patterns.
pub fn load_ignore_file(path: &Path) -> Result<Vec<Regex>> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_ignore_patterns(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "ignore file not found, ignoring nothing");
            Ok(Vec::new())
        }
        Err(e) => Err(KbForgeError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub {
        name: &'static str,
        suffixes: &'static [&'static str],
        pattern: Option<Regex>,
    }

    #[async_trait]
    impl Extractor for Stub {
        fn name(&self) -> &str {
            self.name
        }
        fn suffixes(&self) -> &[&str] {
            self.suffixes
        }
        fn pattern(&self) -> Option<&Regex> {
            self.pattern.as_ref()
        }
        async fn extract(&self, _: &SourceFile) -> Result<Extraction> {
            Ok(Extraction::document(""))
        }
    }

    fn selected_name(selection: Selection) -> Option<String> {
        match selection {
            Selection::Extractor(e) => Some(e.name().to_string()),
            _ => None,
        }
    }

    #[test]
    fn source_root_from_knowledge_path() {
        let nested = SourceFile {
            path: PathBuf::from("/data/src/docs/a/guide.md"),
            knowledge_path: "docs/a/guide.md".into(),
        };
        assert_eq!(nested.source_root(), Path::new("/data/src"));

        let top = SourceFile { path: PathBuf::from("/data/src/x.md"), knowledge_path: "x.md".into() };
        assert_eq!(top.source_root(), Path::new("/data/src"));
    }

    #[test]
    fn builtin_suffixes() {
        let registry = ExtractorRegistry::builtin(None);
        assert_eq!(selected_name(registry.select("a/b.md")).as_deref(), Some("markdown"));
        assert_eq!(selected_name(registry.select("a/B.MARKDOWN")).as_deref(), Some("markdown"));
        assert_eq!(selected_name(registry.select("notes.txt")).as_deref(), Some("text"));
        assert_eq!(selected_name(registry.select("site/index.htm")).as_deref(), Some("html"));
        assert!(matches!(registry.select("photo.png"), Selection::Unsupported));
        assert!(matches!(registry.select("Makefile"), Selection::Unsupported));
    }

    #[test]
    fn hidden_and_temp_files_are_ignored() {
        let registry = ExtractorRegistry::builtin(None);
        assert!(matches!(registry.select("a/.draft.md"), Selection::Ignored));
        assert!(matches!(registry.select("~$report.md"), Selection::Ignored));
    }

    #[test]
    fn first_suffix_owner_wins() {
        let mut registry = ExtractorRegistry::new();
        registry.register(Arc::new(Stub { name: "first", suffixes: &["doc"], pattern: None }));
        registry.register(Arc::new(Stub { name: "second", suffixes: &["doc", "rtf"], pattern: None }));
        assert_eq!(selected_name(registry.select("x.doc")).as_deref(), Some("first"));
        assert_eq!(selected_name(registry.select("x.rtf")).as_deref(), Some("second"));
    }

    #[test]
    fn ignore_beats_pattern_beats_suffix() {
        let mut registry = ExtractorRegistry::builtin(None);
        registry.register(Arc::new(Stub {
            name: "changelog",
            suffixes: &[],
            pattern: Some(Regex::new(r"CHANGELOG\.md$").unwrap()),
        }));
        let registry = registry.with_ignore_patterns(parse_ignore_patterns("^drafts/\n").unwrap());

        assert_eq!(selected_name(registry.select("CHANGELOG.md")).as_deref(), Some("changelog"));
        assert_eq!(selected_name(registry.select("README.md")).as_deref(), Some("markdown"));
        assert!(matches!(registry.select("drafts/CHANGELOG.md"), Selection::Ignored));
    }

    #[test]
    fn ignore_file_comments() {
        let patterns = parse_ignore_patterns("# comment\n; also\n// too\n\n\\.bak$\n  node_modules  \n").unwrap();
        assert_eq!(patterns.len(), 2);
        assert!(parse_ignore_patterns("(unclosed").is_err());
        assert!(load_ignore_file(Path::new("/definitely/not/here")).unwrap().is_empty());
    }
}
