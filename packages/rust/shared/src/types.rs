//! Core domain types for kbforge knowledge bases.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the per-knowledge-base state document.
pub const KB_INFO_FILE_NAME: &str = "kb_info.json";

/// Name of the per-knowledge-base record table database.
pub const KNOWLEDGE_DB_FILE_NAME: &str = "knowledge.db";

// ---------------------------------------------------------------------------
// Heading stream
// ---------------------------------------------------------------------------

/// A single heading line from a heading stream.
///
/// `id` is only present before reconciliation, where it anchors the rewrite
/// of the line once its corrected depth is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadingLine {
    /// Nesting depth, 1 for a top-level heading.
    pub depth: usize,
    /// Heading text without markers or id suffix.
    pub text: String,
    /// Opaque identifier attached by an extractor.
    pub id: Option<String>,
}

/// An entry from a source format's own table of contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocItem {
    /// Entry text as it appears in the outline.
    pub content: String,
    /// 1-based outline level.
    pub level: u32,
}

// ---------------------------------------------------------------------------
// Content blocks and records
// ---------------------------------------------------------------------------

/// A provenance-tagged unit of extracted text associated with one title path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentBlock {
    /// Title prefix (when non-empty) followed by the open heading chain.
    pub title_path: Vec<String>,
    /// `title_path` rendered with the section separator.
    pub full_title: String,
    /// Section body wrapped in its provenance tag.
    pub content: String,
}

/// One row of the knowledge table.
///
/// `knowledge_path` is the relative source path and the replace key: every
/// record produced from one source file shares it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaRecord {
    pub simple_title: String,
    pub full_title: String,
    pub content: String,
    pub knowledge_path: String,
}

// ---------------------------------------------------------------------------
// Doc-tree state document
// ---------------------------------------------------------------------------

/// Modification record for a tracked file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Absolute path of the file at the time it was recorded.
    pub dir_path: String,
    /// Modification time in fractional seconds since the Unix epoch.
    pub mtime: f64,
}

/// A directory in the mirrored source tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocTreeNode {
    /// Absolute path of the directory.
    pub dir_path: String,
    /// Subdirectories by name.
    #[serde(default)]
    pub children: BTreeMap<String, DocTreeNode>,
    /// Tracked files by name.
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,
}

impl DocTreeNode {
    /// Create an empty node for `dir_path`.
    pub fn new(dir_path: impl Into<String>) -> Self {
        Self {
            dir_path: dir_path.into(),
            children: BTreeMap::new(),
            files: BTreeMap::new(),
        }
    }

    /// Total number of files tracked at or below this node.
    pub fn file_count(&self) -> usize {
        self.files.len() + self.children.values().map(DocTreeNode::file_count).sum::<usize>()
    }
}

/// The `kb_info.json` document stored at the root of each knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbInfo {
    /// Mirror of the source tree, keyed by the source root's base name.
    pub doc_tree: BTreeMap<String, DocTreeNode>,
    /// When the knowledge base was first created.
    pub create_time: DateTime<Utc>,
    /// When the state was last persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,
    /// Knowledge base name (base name of the output directory).
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kb_info_serialization() {
        let mut root = DocTreeNode::new("/src/docs");
        let mut sub = DocTreeNode::new("/src/docs/guide");
        sub.files.insert(
            "intro.md".into(),
            FileEntry {
                dir_path: "/src/docs/guide/intro.md".into(),
                mtime: 1_700_000_000.25,
            },
        );
        root.children.insert("guide".into(), sub);

        let info = KbInfo {
            doc_tree: BTreeMap::from([("docs".to_string(), root)]),
            create_time: Utc::now(),
            mod_time: None,
            name: "kb".into(),
        };

        let json = serde_json::to_string_pretty(&info).expect("serialize");
        assert!(!json.contains("mod_time"));
        let parsed: KbInfo = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, info);
        assert_eq!(parsed.doc_tree["docs"].file_count(), 1);
    }

    #[test]
    fn doc_tree_node_tolerates_missing_maps() {
        let node: DocTreeNode =
            serde_json::from_str(r#"{"dir_path": "/src"}"#).expect("deserialize");
        assert!(node.children.is_empty());
        assert!(node.files.is_empty());
    }

    #[test]
    fn qa_record_field_names() {
        let record = QaRecord {
            simple_title: "a".into(),
            full_title: "root-a".into(),
            content: "body".into(),
            knowledge_path: "docs/a.md".into(),
        };
        let json = serde_json::to_value(&record).expect("serialize");
        for key in ["simple_title", "full_title", "content", "knowledge_path"] {
            assert!(json.get(key).is_some(), "missing column {key}");
        }
    }
}
