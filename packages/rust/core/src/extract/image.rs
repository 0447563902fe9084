//! Image description through the vision service, and the image extractor.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{instrument, warn};

use kbforge_shared::{KbForgeError, Result};

use super::{Extraction, Extractor, SourceFile};
use crate::client::{ChatClient, ContentPart};
use crate::response::{PageDescription, PageType, parse_page_description};

const DESCRIBE_PROMPT: &str = "You are an image recognition assistant. Describe the content of the image in detail, \
including titles, text, tables, and charts, and any other visible content. Reply in Markdown. \
Do not omit anything and do not invent anything.";

const PAGE_PROMPT: &str = r#"You are an image recognition assistant. Analyze the page image and reply in exactly this format:

@=@page_type # required
one of: title, chapter, contents, content, copyright, decoration, ending, other
@=@title # optional
page title
@=@summary # required
one-sentence summary of the page
@=@content # optional
detailed content in Markdown
@=@chart # optional
* Chart: chart title

chart content
@=@table # optional
* Table: table title

table content in Markdown

Content must be complete and accurate. Do not invent anything."#;

/// MIME type for an image path, by extension.
pub fn image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "tif" | "tiff" => "image/tiff",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}

/// Vision service wrapper for free-form and page-structured descriptions.
#[derive(Debug, Clone)]
pub struct ImageDescriber {
    client: ChatClient,
}

impl ImageDescriber {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }

    /// Free-form Markdown description.
    #[instrument(skip_all, fields(%mime, bytes = bytes.len()))]
    pub async fn describe(&self, bytes: &[u8], mime: &str) -> Result<String> {
        let reply = self
            .client
            .complete(DESCRIBE_PROMPT, vec![ContentPart::image(mime, bytes)])
            .await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(KbForgeError::validation("empty image description"));
        }
        Ok(reply.to_string())
    }

    /// Structured page analysis.
    #[instrument(skip_all, fields(%mime, bytes = bytes.len()))]
    pub async fn analyze_page(&self, bytes: &[u8], mime: &str) -> Result<PageDescription> {
        let reply = self
            .client
            .complete(PAGE_PROMPT, vec![ContentPart::image(mime, bytes)])
            .await?;
        parse_page_description(&reply)
    }
}

/// Extractor for standalone images.
pub struct ImageExtractor {
    describer: Arc<ImageDescriber>,
}

impl ImageExtractor {
    pub fn new(describer: Arc<ImageDescriber>) -> Self {
        Self { describer }
    }
}

#[async_trait]
impl Extractor for ImageExtractor {
    fn name(&self) -> &str {
        "image"
    }

    fn suffixes(&self) -> &[&str] {
        &["png", "jpg", "jpeg", "tiff"]
    }

    async fn extract(&self, source: &SourceFile) -> Result<Extraction> {
        let bytes = tokio::fs::read(&source.path)
            .await
            .map_err(|e| KbForgeError::extraction(&source.path, e.to_string()))?;

        let page = match self.describer.analyze_page(&bytes, image_mime(&source.path)).await {
            Ok(page) => page,
            Err(e) => {
                warn!(path = %source.knowledge_path, error = %e, "page analysis failed, description left empty");
                undescribed_page(&source.path)
            }
        };
        Ok(Extraction::Pages(vec![page]))
    }
}

/// A content page titled by the file stem, with no description.
fn undescribed_page(path: &Path) -> PageDescription {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    PageDescription {
        page_type: PageType::Content,
        title: Some(stem),
        summary: String::new(),
        content: None,
        chart: None,
        table: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::assemble_pages;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn describer(server: &MockServer) -> Arc<ImageDescriber> {
        let client = ChatClient::new(&server.uri(), None, "vision", Duration::from_secs(5), 0, 1).unwrap();
        Arc::new(ImageDescriber::new(client))
    }

    #[test]
    fn mime_by_extension() {
        assert_eq!(image_mime(Path::new("a.PNG")), "image/png");
        assert_eq!(image_mime(Path::new("a.tiff")), "image/tiff");
        assert_eq!(image_mime(Path::new("a.jpg")), "image/jpeg");
    }

    #[tokio::test]
    async fn image_becomes_single_page() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("data:image/png;base64,"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "content":
                    "@=@page_type\ncontent\n@=@title\nFloor plan\n@=@summary\nOffice layout" } }]
            })))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("plan.png");
        std::fs::write(&path, b"\x89PNG fake").unwrap();

        let extractor = ImageExtractor::new(describer(&server));
        let source = SourceFile { path, knowledge_path: "plan.png".into() };
        let Extraction::Pages(pages) = extractor.extract(&source).await.unwrap() else {
            panic!("expected pages");
        };
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page_type, PageType::Content);
        assert_eq!(pages[0].title.as_deref(), Some("Floor plan"));
    }

    #[tokio::test]
    async fn failed_analysis_leaves_description_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "content": "Sorry, I can't see the image." } }]
            })))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.jpg");
        std::fs::write(&path, b"jpeg").unwrap();

        let extractor = ImageExtractor::new(describer(&server));
        let source = SourceFile { path, knowledge_path: "shots/x.jpg".into() };
        let Extraction::Pages(pages) = extractor.extract(&source).await.unwrap() else {
            panic!("expected pages");
        };
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].title.as_deref(), Some("x"));
        assert!(pages[0].summary.is_empty());

        let records = assemble_pages(&pages, "shots", "shots/x.jpg");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].full_title, "shots-x");
        assert!(records[0].content.contains("@section: shots/x.jpg"));
    }

    #[tokio::test]
    async fn unreadable_image_fails_the_file() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(500)).expect(0).mount(&server).await;

        let tmp = TempDir::new().unwrap();
        let extractor = ImageExtractor::new(describer(&server));
        let source = SourceFile { path: tmp.path().join("gone.png"), knowledge_path: "gone.png".into() };
        assert!(extractor.extract(&source).await.is_err());
    }
}
