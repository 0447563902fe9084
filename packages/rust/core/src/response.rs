//! Parsing of collaborator replies.
//!
//! Replies come either as JSON (possibly fenced or wrapped in prose) or in a
//! delimiter-tagged plain-text form where `@=@<field>` lines open sections.
//! Both shapes fail closed: malformed or incomplete replies are errors.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use kbforge_shared::{KbForgeError, Result};

/// Field delimiter of the tagged reply form.
pub const FIELD_MARKER: &str = "@=@";

/// Deserialize JSON from a model reply.
///
/// Accepts bare JSON, JSON inside a ```json fence, or JSON surrounded by
/// prose (first `[`/`{` through the matching last `]`/`}`).
pub fn extract_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    let trimmed = strip_fence(text.trim());
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    let start = trimmed
        .find(['[', '{'])
        .ok_or_else(|| KbForgeError::parse("reply contains no JSON"))?;
    let close = if trimmed[start..].starts_with('[') { ']' } else { '}' };
    let end = trimmed
        .rfind(close)
        .filter(|&end| end > start)
        .ok_or_else(|| KbForgeError::parse("reply contains unterminated JSON"))?;

    serde_json::from_str(&trimmed[start..=end])
        .map_err(|e| KbForgeError::parse(format!("invalid JSON in reply: {e}")))
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

// ---------------------------------------------------------------------------
// Tagged sections
// ---------------------------------------------------------------------------

/// Fields of a tagged reply, in field-name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaggedSections {
    fields: BTreeMap<String, String>,
}

impl TaggedSections {
    /// Parse `@=@field` sections. A trailing `# comment` on a tag line is
    /// ignored. Text before the first tag and repeated fields are errors.
    pub fn parse(text: &str) -> Result<Self> {
        let mut fields = BTreeMap::new();
        let mut current: Option<(String, Vec<&str>)> = None;

        for line in text.lines() {
            if let Some(tag) = line.trim_start().strip_prefix(FIELD_MARKER) {
                let name = tag.split('#').next().unwrap_or("").trim().to_lowercase();
                if name.is_empty() {
                    return Err(KbForgeError::parse("empty field name in tagged reply"));
                }
                if let Some((prev, lines)) = current.take() {
                    insert_field(&mut fields, prev, &lines)?;
                }
                current = Some((name, Vec::new()));
                continue;
            }

            match current.as_mut() {
                Some((_, lines)) => lines.push(line),
                None if line.trim().is_empty() => {}
                None => {
                    return Err(KbForgeError::parse(format!(
                        "text before first {FIELD_MARKER} tag: {line:?}"
                    )));
                }
            }
        }

        if let Some((prev, lines)) = current {
            insert_field(&mut fields, prev, &lines)?;
        }
        if fields.is_empty() {
            return Err(KbForgeError::parse("reply contains no tagged fields"));
        }
        Ok(Self { fields })
    }

    /// Field value, or `None` when absent or blank.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Field value, failing when absent or blank.
    pub fn require(&self, field: &str) -> Result<&str> {
        self.get(field)
            .ok_or_else(|| KbForgeError::validation(format!("required field '{field}' missing")))
    }
}

fn insert_field(fields: &mut BTreeMap<String, String>, name: String, lines: &[&str]) -> Result<()> {
    if fields.contains_key(&name) {
        return Err(KbForgeError::parse(format!("field '{name}' repeated")));
    }
    fields.insert(name, lines.join("\n").trim().to_string());
    Ok(())
}

// ---------------------------------------------------------------------------
// Page descriptions
// ---------------------------------------------------------------------------

/// Role of a page, slide, or image in its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    Title,
    Chapter,
    Contents,
    Content,
    Copyright,
    Decoration,
    Ending,
    Other,
}

impl FromStr for PageType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        Ok(match normalized.as_str() {
            "title" | "cover" => Self::Title,
            "chapter" | "chapter_title" | "section" => Self::Chapter,
            "contents" | "toc" | "table_of_contents" => Self::Contents,
            "content" => Self::Content,
            "copyright" => Self::Copyright,
            "decoration" => Self::Decoration,
            "ending" | "end" => Self::Ending,
            _ => Self::Other,
        })
    }
}

impl<'de> Deserialize<'de> for PageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let Ok(page_type) = raw.parse::<PageType>();
        Ok(page_type)
    }
}

/// Structured analysis of one page image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageDescription {
    pub page_type: PageType,
    #[serde(default)]
    pub title: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "text_or_map")]
    pub chart: Option<String>,
    #[serde(default, deserialize_with = "text_or_map")]
    pub table: Option<String>,
}

/// Charts and tables arrive either as Markdown text or as `{title: body}` maps.
fn text_or_map<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Object(map)) => Some(
            map.into_iter()
                .map(|(k, v)| match v {
                    serde_json::Value::String(s) => format!("* {k}\n\n{s}"),
                    other => format!("* {k}\n\n{other}"),
                })
                .collect::<Vec<_>>()
                .join("\n---\n"),
        ),
        Some(other) => Some(other.to_string()),
    })
}

/// Parse a page description reply, JSON shape first, tagged shape second.
pub fn parse_page_description(text: &str) -> Result<PageDescription> {
    let json_err = match extract_json::<PageDescription>(text) {
        Ok(desc) => return validate(desc),
        Err(e) => e,
    };

    let sections = TaggedSections::parse(text).map_err(|tag_err| {
        KbForgeError::parse(format!(
            "page description unreadable (json: {json_err}; tagged: {tag_err})"
        ))
    })?;

    let Ok(page_type) = sections.require("page_type")?.parse::<PageType>();
    validate(PageDescription {
        page_type,
        title: sections.get("title").map(str::to_string),
        summary: sections.require("summary")?.to_string(),
        content: sections.get("content").map(str::to_string),
        chart: sections.get("chart").map(str::to_string),
        table: sections.get("table").map(str::to_string),
    })
}

fn validate(mut desc: PageDescription) -> Result<PageDescription> {
    desc.summary = desc.summary.trim().to_string();
    if desc.summary.is_empty() {
        return Err(KbForgeError::validation("required field 'summary' is empty"));
    }
    for field in [&mut desc.title, &mut desc.content, &mut desc.chart, &mut desc.table] {
        if field.as_deref().is_some_and(|v| v.trim().is_empty()) {
            *field = None;
        }
    }
    Ok(desc)
}
