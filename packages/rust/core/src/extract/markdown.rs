//! Markdown sources, with optional inline image descriptions.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64_STANDARD;
use regex::{Captures, Regex};
use tracing::{debug, warn};

use kbforge_markdown::{FenceTracker, escape_block_markers, resource_tag};
use kbforge_shared::{KbForgeError, Result};

use super::image::{ImageDescriber, image_mime};
use super::{Extraction, Extractor, SourceFile};

/// `![alt](src "title")` or `<img ... src="...">`.
static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"!\[[^\]]*\]\(\s*<?([^)\s>]+)>?(?:\s+"[^"]*")?\s*\)|<img\s[^>]*?src\s*=\s*["']([^"']+)["'][^>]*>"#,
    )
    .expect("valid regex")
});

static DATA_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^data:([\w/+.-]+);base64,(.+)$").expect("valid regex"));

/// Extractor for `.md` and `.markdown` files.
pub struct MarkdownExtractor {
    describer: Option<Arc<ImageDescriber>>,
}

impl MarkdownExtractor {
    pub fn new(describer: Option<Arc<ImageDescriber>>) -> Self {
        Self { describer }
    }
}

#[async_trait]
impl Extractor for MarkdownExtractor {
    fn name(&self) -> &str {
        "markdown"
    }

    fn suffixes(&self) -> &[&str] {
        &["md", "markdown"]
    }

    async fn extract(&self, source: &SourceFile) -> Result<Extraction> {
        let markdown = tokio::fs::read_to_string(&source.path)
            .await
            .map_err(|e| KbForgeError::extraction(&source.path, e.to_string()))?;

        let Some(describer) = &self.describer else {
            return Ok(Extraction::document(markdown));
        };

        let root = tokio::fs::canonicalize(source.source_root())
            .await
            .map_err(|e| KbForgeError::extraction(&source.path, format!("source root: {e}")))?;
        let scope = ImageScope {
            base_dir: source.path.parent().unwrap_or(Path::new(".")),
            root: &root,
            knowledge_path: &source.knowledge_path,
        };
        let markdown = describe_inline_images(&markdown, &scope, describer).await;
        Ok(Extraction::document(markdown))
    }
}

/// Where image references in one file resolve, and how far they may reach.
struct ImageScope<'a> {
    /// Directory of the Markdown file; relative references start here.
    base_dir: &'a Path,
    /// Canonical source root; file images must resolve inside it.
    root: &'a Path,
    knowledge_path: &'a str,
}

/// Where an inline image's bytes come from.
enum ImageSource {
    File(PathBuf),
    Inline { mime: String, bytes: Vec<u8> },
    Remote,
}

fn classify_source(src: &str, base_dir: &Path) -> Option<ImageSource> {
    if src.starts_with("http://") || src.starts_with("https://") || src.starts_with("//") {
        return Some(ImageSource::Remote);
    }
    if src.starts_with("data:") {
        let caps = DATA_URL_RE.captures(src)?;
        let bytes = B64_STANDARD.decode(caps[2].trim()).ok()?;
        return Some(ImageSource::Inline { mime: caps[1].to_string(), bytes });
    }
    let path = Path::new(src.strip_prefix("file://").unwrap_or(src));
    Some(ImageSource::File(if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }))
}

/// Replace each local or embedded image reference outside code fences with a
/// tagged description. References that cannot be described stay as written.
async fn describe_inline_images(
    markdown: &str,
    scope: &ImageScope<'_>,
    describer: &ImageDescriber,
) -> String {
    let mut fence = FenceTracker::new();
    let mut out: Vec<String> = Vec::new();

    for line in markdown.lines() {
        if fence.observe(line) || !IMAGE_RE.is_match(line) {
            out.push(line.to_string());
            continue;
        }

        let mut rebuilt = String::with_capacity(line.len());
        let mut last = 0;
        for caps in IMAGE_RE.captures_iter(line) {
            let Some(whole) = caps.get(0) else { continue };
            rebuilt.push_str(&line[last..whole.start()]);
            last = whole.end();

            match describe_reference(&caps, scope, describer).await {
                Some(tagged) => rebuilt.push_str(&tagged),
                None => rebuilt.push_str(whole.as_str()),
            }
        }
        rebuilt.push_str(&line[last..]);
        out.push(rebuilt);
    }

    let mut joined = out.join("\n");
    if markdown.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

async fn describe_reference(
    caps: &Captures<'_>,
    scope: &ImageScope<'_>,
    describer: &ImageDescriber,
) -> Option<String> {
    let src = caps.get(1).or_else(|| caps.get(2))?.as_str();
    let knowledge_path = scope.knowledge_path;

    let (resource, mime, bytes) = match classify_source(src, scope.base_dir) {
        Some(ImageSource::Remote) => {
            debug!(path = %knowledge_path, %src, "remote image left as reference");
            return None;
        }
        None => {
            warn!(path = %knowledge_path, "unreadable data URL image left as reference");
            return None;
        }
        Some(ImageSource::Inline { mime, bytes }) => ("inline image".to_string(), mime, bytes),
        Some(ImageSource::File(path)) => match read_confined(&path, scope.root).await {
            Ok(bytes) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| src.to_string());
                (name, image_mime(&path).to_string(), bytes)
            }
            Err(e) => {
                warn!(path = %knowledge_path, image = %path.display(), error = %e, "image not readable, left as reference");
                return None;
            }
        },
    };

    match describer.describe(&bytes, &mime).await {
        Ok(description) => {
            let body = escape_block_markers(&description);
            Some(resource_tag(knowledge_path, &resource, &body))
        }
        Err(e) => {
            warn!(path = %knowledge_path, image = %resource, error = %e, "image description failed, left as reference");
            None
        }
    }
}

/// Read an image only if it resolves inside `root`, following symlinks.
async fn read_confined(path: &Path, root: &Path) -> std::io::Result<Vec<u8>> {
    let resolved = tokio::fs::canonicalize(path).await?;
    if !resolved.starts_with(root) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("{} is outside the source root", resolved.display()),
        ));
    }
    tokio::fs::read(&resolved).await
}
