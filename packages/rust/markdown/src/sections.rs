//! Section tree builder.
//!
//! Walks a leveled heading stream and emits one [`ContentBlock`] per title
//! path, in document order. The open heading chain is a stack; a heading of
//! depth `d` truncates the stack to `d - 1` entries before being pushed, so a
//! title path never skips a level.

use std::collections::HashMap;

use tracing::{debug, instrument, warn};

use kbforge_shared::{ContentBlock, QaRecord};

use crate::headings::{FenceTracker, count_top_level, parse_heading, starts_with_top_level};
use crate::tags::section_tag;

/// Options controlling how a document is split.
#[derive(Debug, Clone)]
pub struct SectionOptions {
    /// Prepend `# <file stem>` when the document does not open with a level-1 heading.
    pub synthesize_root: bool,
    /// Joins prefix and heading texts into a title path.
    pub separator: String,
}

impl Default for SectionOptions {
    fn default() -> Self {
        Self {
            synthesize_root: true,
            separator: "-".into(),
        }
    }
}

/// Identity of the source file being split.
#[derive(Debug, Clone, Copy)]
pub struct SectionSource<'a> {
    /// Relative path of the source file; also the provenance tag path.
    pub knowledge_path: &'a str,
    /// File name without extension.
    pub file_stem: &'a str,
    /// Rendered title prefix (see [`crate::prefix::render_title_prefix`]).
    pub title_prefix: &'a str,
}

/// Ordered blocks produced for one source file.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionTree {
    /// Prefix actually used, after disambiguation.
    pub title_prefix: String,
    pub blocks: Vec<ContentBlock>,
}

impl SectionTree {
    /// Convert blocks into knowledge records stamped with `knowledge_path`.
    pub fn into_records(self, knowledge_path: &str) -> Vec<QaRecord> {
        self.blocks
            .into_iter()
            .map(|block| QaRecord {
                simple_title: block.full_title.clone(),
                full_title: block.full_title,
                content: block.content,
                knowledge_path: knowledge_path.to_string(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Look up a block by its rendered title path.
    pub fn get(&self, full_title: &str) -> Option<&ContentBlock> {
        self.blocks.iter().find(|b| b.full_title == full_title)
    }
}

/// Split a Markdown document into tagged content blocks.
#[instrument(skip_all, fields(path = %source.knowledge_path))]
pub fn build_sections(markdown: &str, source: SectionSource<'_>, opts: &SectionOptions) -> SectionTree {
    let title_prefix = disambiguate_prefix(markdown, source, &opts.separator);

    let synthesized;
    let markdown = if opts.synthesize_root && !starts_with_top_level(markdown) {
        debug!(stem = source.file_stem, "synthesizing root heading");
        synthesized = format!("# {}\n\n{markdown}", source.file_stem);
        synthesized.as_str()
    } else {
        markdown
    };

    let mut builder = Builder::new(source, title_prefix, &opts.separator);
    let mut fence = FenceTracker::new();

    for line in markdown.lines() {
        if fence.observe(line) {
            builder.buffer.push(line);
            continue;
        }
        match parse_heading(line) {
            Some(heading) => builder.open_heading(heading.depth, heading.text),
            None => builder.buffer.push(line),
        }
    }

    builder.finish()
}

/// Append the file stem to the prefix when the document has several roots.
fn disambiguate_prefix(markdown: &str, source: SectionSource<'_>, separator: &str) -> String {
    let prefix = source.title_prefix.to_string();
    if count_top_level(markdown) <= 1 {
        return prefix;
    }
    if prefix.split(separator).any(|part| part == source.file_stem) {
        return prefix;
    }
    debug!(stem = source.file_stem, "multiple top-level headings, appending file stem to prefix");
    if prefix.is_empty() {
        source.file_stem.to_string()
    } else {
        format!("{prefix}{separator}{}", source.file_stem)
    }
}

struct Builder<'a> {
    source: SectionSource<'a>,
    title_prefix: String,
    separator: &'a str,
    headers: Vec<String>,
    buffer: Vec<&'a str>,
    blocks: Vec<ContentBlock>,
    index: HashMap<String, usize>,
}

impl<'a> Builder<'a> {
    fn new(source: SectionSource<'a>, title_prefix: String, separator: &'a str) -> Self {
        Self {
            source,
            title_prefix,
            separator,
            headers: Vec::new(),
            buffer: Vec::new(),
            blocks: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn open_heading(&mut self, depth: usize, text: String) {
        self.flush();

        let open = self.headers.len();
        let mut depth = depth;
        if depth > open + 1 {
            warn!(
                path = %self.source.knowledge_path,
                heading = %text,
                depth,
                corrected = open + 1,
                "heading level jump, clamping"
            );
            depth = open + 1;
        }

        if depth > open {
            self.headers.push(text);
        } else if depth == open {
            if let Some(top) = self.headers.last_mut() {
                *top = text;
            }
        } else {
            self.headers.truncate(depth - 1);
            self.headers.push(text);
        }
    }

    fn title_path(&self, tail: &[String]) -> Vec<String> {
        let mut path = Vec::with_capacity(tail.len() + 1);
        if !self.title_prefix.is_empty() {
            path.push(self.title_prefix.clone());
        }
        path.extend(tail.iter().cloned());
        path
    }

    fn flush(&mut self) {
        let body = self.buffer.join("\n");
        self.buffer.clear();
        let body = body.trim();
        if body.is_empty() {
            return;
        }

        let (title_path, position) = if self.headers.is_empty() {
            let stem = vec![self.source.file_stem.to_string()];
            (self.title_path(&stem), self.source.file_stem.to_string())
        } else {
            (self.title_path(&self.headers), self.headers.join("-"))
        };

        let content = section_tag(self.source.knowledge_path, &position, body);
        self.push_block(title_path, content);
    }

    fn push_block(&mut self, title_path: Vec<String>, content: String) {
        let full_title = title_path.join(self.separator);
        if let Some(&i) = self.index.get(&full_title) {
            debug!(title = %full_title, "repeated title path, appending content");
            self.blocks[i].content.push_str(&content);
            return;
        }
        self.index.insert(full_title.clone(), self.blocks.len());
        self.blocks.push(ContentBlock {
            title_path,
            full_title,
            content,
        });
    }

    fn finish(mut self) -> SectionTree {
        self.flush();
        SectionTree {
            title_prefix: self.title_prefix,
            blocks: self.blocks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    fn source<'a>(prefix: &'a str, stem: &'a str) -> SectionSource<'a> {
        SectionSource {
            knowledge_path: "docs/a/b.md",
            file_stem: stem,
            title_prefix: prefix,
        }
    }

    fn titles(tree: &SectionTree) -> Vec<&str> {
        tree.blocks.iter().map(|b| b.full_title.as_str()).collect()
    }

    #[test]
    fn splits_nested_sections() {
        let md = "# Title\n\n## Sec1\ntext1\n## Sec2\ntext2";
        let tree = build_sections(md, source("root", "b"), &SectionOptions::default());

        assert_eq!(titles(&tree), vec!["root-Title-Sec1", "root-Title-Sec2"]);
        let sec1 = tree.get("root-Title-Sec1").unwrap();
        assert!(sec1.content.contains("text1"));
        assert!(!sec1.content.contains("text2"));
        assert!(sec1.content.contains("@section: docs/a/b.md: Title-Sec1"));
        assert_eq!(sec1.title_path, vec!["root", "Title", "Sec1"]);
        assert!(tree.get("root-Title-Sec2").unwrap().content.contains("text2"));
    }

    #[test]
    fn heading_without_content_emits_nothing() {
        let md = "# Title\n## Empty\n## Full\nbody";
        let tree = build_sections(md, source("", "b"), &SectionOptions::default());
        assert_eq!(titles(&tree), vec!["Title-Full"]);
    }

    /// Log sink shared between a test and its subscriber.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn level_jump_is_clamped() {
        let md = "# A\na\n# B\nb\n### C\nc";
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let tree = tracing::subscriber::with_default(subscriber, || {
            build_sections(md, source("", "f"), &SectionOptions::default())
        });

        let logged = logs.contents();
        assert!(logged.contains("WARN"), "{logged}");
        assert!(logged.contains("heading level jump"), "{logged}");
        assert!(logged.contains("corrected=2"), "{logged}");
        // Depths [1,1,3] become [1,1,2]; the prefix gains the stem because of two roots.
        assert_eq!(titles(&tree), vec!["f-A", "f-B", "f-B-C"]);
        let c = tree.get("f-B-C").unwrap();
        assert_eq!(c.title_path.len(), 3);
    }

    #[test]
    fn path_never_has_gaps() {
        let md = "# A\n#### D\nd\n## B\n###### F\nf\n# Z\nz";
        let tree = build_sections(md, source("", "f"), &SectionOptions::default());
        for block in &tree.blocks {
            // prefix + at most one new level per heading
            assert!(block.title_path.len() <= 4, "{:?}", block.title_path);
        }
        assert_eq!(titles(&tree), vec!["f-A-D", "f-A-B-F", "f-Z"]);
    }

    #[test]
    fn multiple_roots_append_stem_once() {
        let md = "# One\nx\n# Two\ny";
        let tree = build_sections(md, source("guide", "intro"), &SectionOptions::default());
        assert_eq!(tree.title_prefix, "guide-intro");
        assert_eq!(titles(&tree), vec!["guide-intro-One", "guide-intro-Two"]);

        let tree = build_sections(md, source("guide-intro", "intro"), &SectionOptions::default());
        assert_eq!(tree.title_prefix, "guide-intro");
    }

    #[test]
    fn missing_root_is_synthesized() {
        let md = "Preamble text.\n\n## Details\nmore";
        let tree = build_sections(md, source("p", "notes"), &SectionOptions::default());
        assert_eq!(titles(&tree), vec!["p-notes", "p-notes-Details"]);
        assert!(tree.get("p-notes").unwrap().content.contains("Preamble text."));
    }

    #[test]
    fn code_fences_are_not_headings() {
        let md = "# Setup\n```bash\n# install deps\nmake\n```\n## Next\nok";
        let tree = build_sections(md, source("", "s"), &SectionOptions::default());
        assert_eq!(titles(&tree), vec!["Setup", "Setup-Next"]);
        let setup = tree.get("Setup").unwrap();
        assert!(setup.content.contains("# install deps"));
        assert!(setup.content.contains("```bash"));
    }

    #[test]
    fn headingless_document_without_synthesis() {
        let opts = SectionOptions {
            synthesize_root: false,
            ..SectionOptions::default()
        };
        let tree = build_sections("just a caption\nline two", source("img", "photo"), &opts);
        assert_eq!(titles(&tree), vec!["img-photo"]);
        assert!(tree.blocks[0].content.contains("@section: docs/a/b.md: photo"));
    }

    #[test]
    fn repeated_path_appends() {
        let md = "# T\n## Notes\nfirst\n## Other\nx\n## Notes\nsecond";
        let tree = build_sections(md, source("", "t"), &SectionOptions::default());
        assert_eq!(titles(&tree), vec!["T-Notes", "T-Other"]);
        let notes = tree.get("T-Notes").unwrap();
        assert!(notes.content.contains("first"));
        assert!(notes.content.contains("second"));
    }

    #[test]
    fn into_records_stamps_path() {
        let md = "# T\nbody";
        let records = build_sections(md, source("", "t"), &SectionOptions::default())
            .into_records("docs/t.md");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].simple_title, "T");
        assert_eq!(records[0].full_title, "T");
        assert_eq!(records[0].knowledge_path, "docs/t.md");
    }
}
