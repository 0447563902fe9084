//! Heading reconciliation.
//!
//! Extractors that cannot tell heading depth emit every heading at depth 1
//! with an `@=@<id>` suffix. Reconciliation asks a [`HeadingClassifier`] for
//! the real levels, validates the answer, and rewrites each id-carrying line
//! at its corrected depth. Level 0 removes the line.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use kbforge_markdown::{FenceTracker, headings, parse_heading, render_heading};
use kbforge_shared::{HeadingLine, KbForgeError, Result, TocItem};

use crate::client::{ChatClient, ContentPart};
use crate::response::extract_json;

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// A heading awaiting classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatHeading {
    pub content: String,
    pub id: String,
}

/// Input to a classifier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassifyRequest {
    /// The source format's own outline; may be empty.
    pub reference_toc: Vec<TocItem>,
    /// Headings in document order.
    pub headings: Vec<FlatHeading>,
}

/// A classifier's verdict for one heading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedHeading {
    #[serde(default)]
    pub content: String,
    pub level: i64,
    pub id: String,
}

/// Assigns nesting levels to flat headings.
#[async_trait]
pub trait HeadingClassifier: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, request: &ClassifyRequest) -> Result<Vec<ClassifiedHeading>>;
}

// ---------------------------------------------------------------------------
// Classifiers
// ---------------------------------------------------------------------------

const CLASSIFY_PROMPT: &str = r#"You are a document heading assistant. Using the document outline as a reference, assign a level to every heading.

## Document outline

{toc_list}

## Headings to adjust

{heading_list}

## Rules

1. For immediately consecutive headings with identical text, keep the first and set the level of the others to 0.
2. Prefer the document outline when deciding levels. Levels start at 1 (1 = top-level heading, 2 = second level, and so on).
3. If the document outline is empty, infer levels from the heading text.
4. Do not change heading text, ids, or the order of the list.

## Reply format

Reply with a JSON array only:

[
    {"content": "heading text", "level": 1, "id": "heading id"}
]
"#;

/// Classifier backed by the `[llm]` chat service.
#[derive(Debug, Clone)]
pub struct LlmClassifier {
    client: ChatClient,
}

impl LlmClassifier {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }

    fn prompt(request: &ClassifyRequest) -> Result<String> {
        let toc = serde_json::to_string_pretty(&request.reference_toc)
            .map_err(|e| KbForgeError::parse(e.to_string()))?;
        let headings = serde_json::to_string_pretty(&request.headings)
            .map_err(|e| KbForgeError::parse(e.to_string()))?;
        Ok(CLASSIFY_PROMPT
            .replace("{toc_list}", &toc)
            .replace("{heading_list}", &headings))
    }
}

#[async_trait]
impl HeadingClassifier for LlmClassifier {
    fn name(&self) -> &str {
        "llm"
    }

    async fn classify(&self, request: &ClassifyRequest) -> Result<Vec<ClassifiedHeading>> {
        let prompt = Self::prompt(request)?;
        let reply = self
            .client
            .complete(&prompt, vec![ContentPart::text("Return the adjusted heading list.")])
            .await?;
        extract_json(&reply)
    }
}

/// Offline classifier: outline match, then heading numbering, then level 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutlineClassifier;

static NUMBERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:\.\d+)*)\.?\s+\S").expect("valid regex"));

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl OutlineClassifier {
    fn level_for(text: &str, outline: &HashMap<String, u32>) -> i64 {
        if let Some(&level) = outline.get(&normalize(text)) {
            return i64::from(level.max(1));
        }
        if let Some(caps) = NUMBERED_RE.captures(text.trim()) {
            return caps[1].split('.').count() as i64;
        }
        1
    }
}

#[async_trait]
impl HeadingClassifier for OutlineClassifier {
    fn name(&self) -> &str {
        "outline"
    }

    async fn classify(&self, request: &ClassifyRequest) -> Result<Vec<ClassifiedHeading>> {
        let mut outline = HashMap::new();
        for item in &request.reference_toc {
            outline.entry(normalize(&item.content)).or_insert(item.level);
        }

        Ok(request
            .headings
            .iter()
            .map(|h| ClassifiedHeading {
                content: h.content.clone(),
                level: Self::level_for(&h.content, &outline),
                id: h.id.clone(),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Collect / validate / rewrite
// ---------------------------------------------------------------------------

/// Id-carrying headings in document order.
pub fn collect_flat_headings(markdown: &str) -> Vec<FlatHeading> {
    headings(markdown)
        .filter_map(|h| {
            h.id.map(|id| FlatHeading {
                content: h.text,
                id,
            })
        })
        .collect()
}

/// Deepest heading level a classifier may assign.
pub const MAX_HEADING_LEVEL: i64 = 16;

/// Turn a classifier answer into a level per id.
///
/// Unknown ids are ignored, missing ids get level 1, negative levels or
/// levels above [`MAX_HEADING_LEVEL`] reject the whole answer, and
/// consecutive duplicate texts get level 0 whatever the classifier said.
pub fn validate_levels(
    request: &ClassifyRequest,
    answer: &[ClassifiedHeading],
) -> Result<HashMap<String, u32>> {
    let known: HashSet<&str> = request.headings.iter().map(|h| h.id.as_str()).collect();

    let mut proposed: HashMap<&str, i64> = HashMap::new();
    for item in answer {
        if item.level < 0 {
            return Err(KbForgeError::validation(format!(
                "negative level {} for heading id {}",
                item.level, item.id
            )));
        }
        if item.level > MAX_HEADING_LEVEL {
            return Err(KbForgeError::validation(format!(
                "level {} for heading id {} exceeds {MAX_HEADING_LEVEL}",
                item.level, item.id
            )));
        }
        if !known.contains(item.id.as_str()) {
            warn!(id = %item.id, "classifier returned unknown heading id, ignoring");
            continue;
        }
        proposed.insert(item.id.as_str(), item.level);
    }

    let mut levels = HashMap::with_capacity(request.headings.len());
    let mut previous: Option<&str> = None;
    for heading in &request.headings {
        let text = heading.content.trim();
        let level = if previous == Some(text) {
            0
        } else {
            match proposed.get(heading.id.as_str()) {
                Some(&0) => {
                    warn!(id = %heading.id, heading = %text, "classifier dropped a non-duplicate heading, keeping it");
                    1
                }
                Some(&level) => u32::try_from(level).unwrap_or(1),
                None => {
                    debug!(id = %heading.id, "no level returned, using 1");
                    1
                }
            }
        };
        levels.insert(heading.id.clone(), level);
        previous = Some(text);
    }
    Ok(levels)
}

/// Re-render id-carrying headings at their assigned level; level 0 deletes the line.
pub fn rewrite_headings(markdown: &str, levels: &HashMap<String, u32>) -> String {
    rewrite_id_lines(markdown, |heading| {
        let id = heading.id.as_deref().unwrap_or_default();
        levels.get(id).copied().unwrap_or(1) as usize
    })
}

/// Degraded rendering: every id-carrying heading at depth 1, ids removed.
pub fn flatten_headings(markdown: &str) -> String {
    rewrite_id_lines(markdown, |_| 1)
}

fn rewrite_id_lines(markdown: &str, depth_of: impl Fn(&HeadingLine) -> usize) -> String {
    let mut fence = FenceTracker::new();
    let mut out: Vec<String> = Vec::new();

    for line in markdown.lines() {
        if fence.observe(line) {
            out.push(line.to_string());
            continue;
        }
        match parse_heading(line) {
            Some(heading) if heading.id.is_some() => {
                let depth = depth_of(&heading);
                if depth == 0 {
                    continue;
                }
                out.push(render_heading(&HeadingLine {
                    depth,
                    text: heading.text,
                    id: None,
                }));
            }
            _ => out.push(line.to_string()),
        }
    }

    out.join("\n")
}

/// Reconcile heading levels, falling back to flat headings on any failure.
#[instrument(skip_all, fields(classifier = classifier.name()))]
pub async fn reconcile(
    markdown: &str,
    reference_toc: &[TocItem],
    classifier: &dyn HeadingClassifier,
) -> String {
    let request = ClassifyRequest {
        reference_toc: reference_toc.to_vec(),
        headings: collect_flat_headings(markdown),
    };
    if request.headings.is_empty() {
        return markdown.to_string();
    }

    let outcome = match classifier.classify(&request).await {
        Ok(answer) => validate_levels(&request, &answer),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(levels) => {
            debug!(headings = levels.len(), "heading levels reconciled");
            rewrite_headings(markdown, &levels)
        }
        Err(e) => {
            warn!(error = %e, "heading reconciliation failed, falling back to flat headings");
            flatten_headings(markdown)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn flat(items: &[(&str, &str)]) -> Vec<FlatHeading> {
        items
            .iter()
            .map(|(c, id)| FlatHeading {
                content: c.to_string(),
                id: id.to_string(),
            })
            .collect()
    }

    struct FailingClassifier;

    #[async_trait]
    impl HeadingClassifier for FailingClassifier {
        fn name(&self) -> &str {
            "failing"
        }
        async fn classify(&self, _: &ClassifyRequest) -> Result<Vec<ClassifiedHeading>> {
            Err(KbForgeError::Collaborator("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn consecutive_duplicates_get_level_zero() {
        let request = ClassifyRequest {
            reference_toc: vec![],
            headings: flat(&[("A", "id1"), ("A", "id2"), ("B", "id3")]),
        };
        let answer = OutlineClassifier.classify(&request).await.unwrap();
        let levels = validate_levels(&request, &answer).unwrap();
        assert_eq!(levels["id1"], 1);
        assert_eq!(levels["id2"], 0);
        assert_eq!(levels["id3"], 1);
    }

    #[tokio::test]
    async fn outline_prefers_toc_then_numbering() {
        let request = ClassifyRequest {
            reference_toc: vec![
                TocItem { content: "Intro".into(), level: 1 },
                TocItem { content: "Background  Work".into(), level: 2 },
            ],
            headings: flat(&[
                ("Intro", "a"),
                ("background work", "b"),
                ("2.3.1 Details", "c"),
                ("Appendix", "d"),
            ]),
        };
        let answer = OutlineClassifier.classify(&request).await.unwrap();
        let levels: Vec<i64> = answer.iter().map(|h| h.level).collect();
        assert_eq!(levels, vec![1, 2, 3, 1]);
    }

    #[test]
    fn validation_rules() {
        let request = ClassifyRequest {
            reference_toc: vec![],
            headings: flat(&[("A", "a"), ("B", "b"), ("C", "c")]),
        };
        let answer = vec![
            ClassifiedHeading { content: "A".into(), level: 1, id: "a".into() },
            ClassifiedHeading { content: "B".into(), level: 0, id: "b".into() },
            ClassifiedHeading { content: "?".into(), level: 3, id: "zzz".into() },
        ];
        let levels = validate_levels(&request, &answer).unwrap();
        assert_eq!(levels["a"], 1);
        assert_eq!(levels["b"], 1, "non-duplicate cannot be dropped");
        assert_eq!(levels["c"], 1, "missing id defaults to 1");
        assert!(!levels.contains_key("zzz"));

        let negative = vec![ClassifiedHeading { content: "A".into(), level: -1, id: "a".into() }];
        assert!(validate_levels(&request, &negative).is_err());
    }

    #[test]
    fn oversized_levels_are_rejected() {
        let request = ClassifyRequest {
            reference_toc: vec![],
            headings: flat(&[("A", "a"), ("B", "b")]),
        };
        for level in [1_000_000, 9_000_000_000, MAX_HEADING_LEVEL + 1] {
            let answer = vec![
                ClassifiedHeading { content: "A".into(), level: 1, id: "a".into() },
                ClassifiedHeading { content: "B".into(), level, id: "b".into() },
            ];
            assert!(validate_levels(&request, &answer).is_err(), "level {level} accepted");
        }

        let deepest = vec![ClassifiedHeading { content: "B".into(), level: MAX_HEADING_LEVEL, id: "b".into() }];
        let levels = validate_levels(&request, &deepest).unwrap();
        assert_eq!(levels["b"], MAX_HEADING_LEVEL as u32);
    }

    #[tokio::test]
    async fn oversized_llm_level_falls_back_to_flat() {
        let server = MockServer::start().await;
        let reply = r#"[{"content":"A","level":1,"id":"x"},{"content":"B","level":9000000000,"id":"y"}]"#;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "content": reply } }]
            })))
            .mount(&server)
            .await;

        let client = ChatClient::new(&server.uri(), None, "m", Duration::from_secs(5), 0, 1).unwrap();
        let out = reconcile("# A@=@x
text
# B@=@y
body", &[], &LlmClassifier::new(client)).await;
        assert_eq!(out, "# A\ntext\n# B\nbody");
    }

    #[test]
    fn rewrite_applies_levels_and_drops_zero() {
        let md = "# Guide@=@g\nintro\n# Guide@=@dup\n# Setup@=@s\n```\n# Guide@=@code\n```\n## Plain";
        let levels = HashMap::from([
            ("g".to_string(), 1),
            ("dup".to_string(), 0),
            ("s".to_string(), 2),
        ]);
        let out = rewrite_headings(md, &levels);
        assert_eq!(
            out,
            "# Guide\nintro\n## Setup\n```\n# Guide@=@code\n```\n## Plain"
        );
    }

    #[tokio::test]
    async fn reconcile_falls_back_to_flat() {
        let md = "# One@=@1\ntext\n# Two@=@2";
        let out = reconcile(md, &[], &FailingClassifier).await;
        assert_eq!(out, "# One\ntext\n# Two");
    }

    #[tokio::test]
    async fn reconcile_with_outline() {
        let md = "# Intro@=@1\na\n# 1.1 Scope@=@2\nb\n# 1.1 Scope@=@3\nc";
        let out = reconcile(md, &[], &OutlineClassifier).await;
        assert_eq!(out, "# Intro\na\n## 1.1 Scope\nb\nc");
    }

    #[tokio::test]
    async fn llm_classifier_parses_reply() {
        let server = MockServer::start().await;
        let reply = r#"```json
[{"content":"A","level":1,"id":"x"},{"content":"B","level":2,"id":"y"}]
```"#;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "content": reply } }]
            })))
            .mount(&server)
            .await;

        let client = ChatClient::new(&server.uri(), None, "m", Duration::from_secs(5), 0, 1).unwrap();
        let classifier = LlmClassifier::new(client);
        let out = reconcile("# A@=@x\n# B@=@y\nbody", &[], &classifier).await;
        assert_eq!(out, "# A\n## B\nbody");
    }

    #[tokio::test]
    async fn llm_garbage_reply_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "content": "I cannot help with that." } }]
            })))
            .mount(&server)
            .await;

        let client = ChatClient::new(&server.uri(), None, "m", Duration::from_secs(5), 0, 1).unwrap();
        let out = reconcile("# A@=@x\n# B@=@y", &[], &LlmClassifier::new(client)).await;
        assert_eq!(out, "# A\n# B");
    }
}
