//! Assembly of page descriptions into knowledge records.
//!
//! Pages are walked in order. Title pages set the document title, chapter
//! pages the chapter title, and content pages emit records titled
//! `prefix-document-chapter-page`. Consecutive content pages sharing a title
//! merge into one record. A single-page source is always treated as content.

use tracing::{debug, warn};

use kbforge_markdown::section_tag;
use kbforge_shared::QaRecord;

use crate::response::{PageDescription, PageType};

/// Position descriptor for a 1-based page number.
pub fn page_position(number: usize) -> String {
    format!("page {number:04}")
}

/// Page body: content, chart, and table sections, or the summary when all are absent.
fn page_body(page: &PageDescription) -> String {
    let parts: Vec<&str> = [&page.content, &page.chart, &page.table]
        .into_iter()
        .filter_map(|p| p.as_deref())
        .collect();
    if parts.is_empty() {
        page.summary.clone()
    } else {
        parts.join("\n\n")
    }
}

/// Build records from ordered page descriptions of one source file.
pub fn assemble_pages(pages: &[PageDescription], title_prefix: &str, knowledge_path: &str) -> Vec<QaRecord> {
    let mut records: Vec<QaRecord> = Vec::new();
    let mut doc_title = String::new();
    let mut chapter_title = String::new();
    // Title of the last content page and the index of its record.
    let mut open_content: Option<(String, usize)> = None;
    let single = pages.len() == 1;

    for (i, page) in pages.iter().enumerate() {
        let position = page_position(i + 1);
        let page_type = if single { PageType::Content } else { page.page_type };
        let page_title = page.title.clone().unwrap_or_else(|| page.summary.clone());

        match page_type {
            PageType::Title => doc_title = page_title,
            PageType::Chapter => {
                chapter_title = page_title;
                open_content = None;
            }
            PageType::Contents => debug!(%position, "skipping contents page"),
            PageType::Content => {
                let content = section_tag(knowledge_path, &position, &page_body(page));

                if let Some((title, idx)) = &open_content {
                    if *title == page_title {
                        records[*idx].content.push('\n');
                        records[*idx].content.push_str(&content);
                        continue;
                    }
                }

                let full_title = [title_prefix, doc_title.as_str(), chapter_title.as_str(), page_title.as_str()]
                    .into_iter()
                    .filter(|part| !part.is_empty())
                    .collect::<Vec<_>>()
                    .join("-");
                open_content = Some((page_title.clone(), records.len()));
                records.push(QaRecord {
                    simple_title: page_title,
                    full_title,
                    content,
                    knowledge_path: knowledge_path.to_string(),
                });
            }
            other => {
                warn!(path = %knowledge_path, %position, page_type = ?other, "page type not included in knowledge records");
            }
        }
    }

    records
}
