//! HTML extractor.

use async_trait::async_trait;

use kbforge_markdown::{html_title, html_to_markdown, starts_with_top_level};
use kbforge_shared::{KbForgeError, Result};

use super::{Extraction, Extractor, SourceFile};

pub struct HtmlExtractor;

#[async_trait]
impl Extractor for HtmlExtractor {
    fn name(&self) -> &str {
        "html"
    }

    fn suffixes(&self) -> &[&str] {
        &["html", "htm"]
    }

    async fn extract(&self, source: &SourceFile) -> Result<Extraction> {
        let html = tokio::fs::read_to_string(&source.path)
            .await
            .map_err(|e| KbForgeError::extraction(&source.path, e.to_string()))?;

        let markdown = html_to_markdown(&html)
            .map_err(|e| KbForgeError::extraction(&source.path, e.to_string()))?;

        // The document title stands in for a missing top-level heading.
        let markdown = match html_title(&html) {
            Some(title) if !starts_with_top_level(&markdown) => format!("# {title}\n\n{markdown}"),
            _ => markdown,
        };

        Ok(Extraction::document(markdown))
    }
}
