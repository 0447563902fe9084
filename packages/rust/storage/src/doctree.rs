//! Doc-tree state tracker backed by `kb_info.json`.
//!
//! Mirrors the source directory tree and records the modification time seen
//! when each file was last committed. A file is new-or-changed when it has no
//! entry or its current mtime is strictly greater than the stored one.

use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use kbforge_shared::{DocTreeNode, FileEntry, KB_INFO_FILE_NAME, KbForgeError, KbInfo, Result};
use tracing::{debug, info, warn};

/// In-memory state document plus where it persists.
#[derive(Debug)]
pub struct DocTreeState {
    path: PathBuf,
    source_root: PathBuf,
    root_name: String,
    info: KbInfo,
}

impl DocTreeState {
    /// Load `kb_info.json` from `kb_dir`, or start a fresh document.
    ///
    /// An unreadable document is moved aside to `kb_info.json.corrupt` and
    /// replaced by a fresh one.
    pub async fn load_or_create(kb_dir: &Path, source_root: &Path) -> Result<Self> {
        let path = kb_dir.join(KB_INFO_FILE_NAME);
        let root_name = base_name(source_root);

        let info = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<KbInfo>(&bytes) {
                Ok(info) => {
                    debug!(path = %path.display(), files = info.doc_tree.values().map(DocTreeNode::file_count).sum::<usize>(), "loaded state document");
                    info
                }
                Err(e) => {
                    let aside = path.with_extension("json.corrupt");
                    warn!(
                        path = %path.display(),
                        error = %e,
                        moved_to = %aside.display(),
                        "state document unreadable, starting fresh; all files will be reprocessed"
                    );
                    tokio::fs::rename(&path, &aside)
                        .await
                        .map_err(|e| KbForgeError::io(&path, e))?;
                    new_kb_info(kb_dir)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no state document, creating one");
                new_kb_info(kb_dir)
            }
            Err(e) => return Err(KbForgeError::io(&path, e)),
        };

        Ok(Self {
            path,
            source_root: source_root.to_path_buf(),
            root_name,
            info,
        })
    }

    /// Whether `rel_path` (relative to the source root) needs processing at `mtime`.
    pub fn is_new_or_changed(&self, rel_path: &Path, mtime: f64) -> bool {
        let Some((dirs, file)) = split_rel_path(rel_path) else {
            return true;
        };
        let Some(mut node) = self.info.doc_tree.get(&self.root_name) else {
            return true;
        };
        for dir in &dirs {
            match node.children.get(dir) {
                Some(child) => node = child,
                None => return true,
            }
        }
        match node.files.get(&file) {
            Some(entry) => mtime > entry.mtime,
            None => true,
        }
    }

    /// Store `mtime` for `rel_path`, creating ancestor nodes as needed.
    pub fn record_updated(&mut self, rel_path: &Path, mtime: f64) {
        let Some((dirs, file)) = split_rel_path(rel_path) else {
            warn!(path = %rel_path.display(), "cannot record a path without a file name");
            return;
        };

        let mut dir_path = self.source_root.clone();
        let mut node = self
            .info
            .doc_tree
            .entry(self.root_name.clone())
            .or_insert_with(|| DocTreeNode::new(dir_path.to_string_lossy()));

        for dir in dirs {
            dir_path.push(&dir);
            node = node
                .children
                .entry(dir)
                .or_insert_with(|| DocTreeNode::new(dir_path.to_string_lossy()));
        }

        node.files.insert(
            file,
            FileEntry {
                dir_path: self.source_root.join(rel_path).to_string_lossy().into_owned(),
                mtime,
            },
        );
    }

    /// Write the document atomically (temp file, then rename), stamping `mod_time`.
    pub async fn persist(&mut self) -> Result<()> {
        self.info.mod_time = Some(Utc::now());

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| KbForgeError::Storage(format!("{}: {e}", parent.display())))?;
        }

        let bytes = serde_json::to_vec_pretty(&self.info)
            .map_err(|e| KbForgeError::Storage(format!("serialize state document: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| KbForgeError::Storage(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| KbForgeError::Storage(format!("{}: {e}", self.path.display())))?;
        Ok(())
    }

    pub fn info(&self) -> &KbInfo {
        &self.info
    }

    /// Files tracked under the current source root.
    pub fn tracked_files(&self) -> usize {
        self.info
            .doc_tree
            .get(&self.root_name)
            .map_or(0, DocTreeNode::file_count)
    }
}

fn new_kb_info(kb_dir: &Path) -> KbInfo {
    KbInfo {
        doc_tree: Default::default(),
        create_time: Utc::now(),
        mod_time: None,
        name: base_name(kb_dir),
    }
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Split a relative path into its directory names and file name.
fn split_rel_path(rel_path: &Path) -> Option<(Vec<String>, String)> {
    let mut parts: Vec<String> = rel_path
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    let file = parts.pop()?;
    Some((parts, file))
}
