//! Tidying of converted HTML before it is split into sections.
//!
//! Heading lines are never rewritten here; their depth is what the section
//! builder consumes.

use std::sync::LazyLock;

use regex::Regex;

use crate::headings::FenceTracker;

/// Fence openers carrying a class-derived language (`language-js`, `lang-py`).
static FENCE_LANG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*```)(?:language-|lang-|highlight-)(\w+)").expect("valid regex")
});

/// Layout containers htmd leaves in place.
static CONTAINER_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"</?(?:div|span|section|article|aside|header|footer|figure|figcaption|details|summary|main|nav)(?:\s[^>]*)?>",
    )
    .expect("valid regex")
});

/// Tidy converted Markdown: one pass per line, then blank-run collapsing.
pub(crate) fn tidy(md: &str) -> String {
    let mut fence = FenceTracker::new();
    let mut out = String::with_capacity(md.len());
    let mut blank_run = 0;

    for line in md.lines() {
        let line = if fence.observe(line) {
            FENCE_LANG_RE.replace(line, "$1$2").trim_end().to_string()
        } else if fence.in_fence() {
            line.trim_end().to_string()
        } else {
            CONTAINER_TAG_RE.replace_all(line, "").trim_end().to_string()
        };

        if line.is_empty() && !fence.in_fence() {
            blank_run += 1;
            if blank_run > 2 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(&line);
        out.push('\n');
    }

    let body = out.trim_matches('\n');
    format!("{body}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_runs_capped_at_two() {
        assert_eq!(tidy("a\n\n\n\n\nb"), "a\n\n\nb\n");
        assert_eq!(tidy("a\n\nb"), "a\n\nb\n");
    }

    #[test]
    fn fence_language_prefix_removed() {
        let out = tidy("```language-python\nprint('hi')\n```");
        assert_eq!(out, "```python\nprint('hi')\n```\n");
        assert_eq!(tidy("```rust\nfn main() {}\n```"), "```rust\nfn main() {}\n```\n");
    }

    #[test]
    fn containers_stripped_outside_fences_only() {
        let out = tidy("<div class=\"note\">Important</div>\n```html\n<div>kept</div>\n```");
        assert!(out.starts_with("Important\n"));
        assert!(out.contains("<div>kept</div>"));
    }

    #[test]
    fn blank_lines_inside_fences_survive() {
        let md = "```\na\n\n\n\nb\n```";
        assert_eq!(tidy(md), format!("{md}\n"));
    }

    #[test]
    fn headings_and_trailing_space() {
        let out = tidy("\n\n# One   \n\ntext\t\n\n#### Deep\n\n\n");
        assert_eq!(out, "# One\n\ntext\n\n#### Deep\n");
    }
}
