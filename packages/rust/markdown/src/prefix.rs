//! Title prefix templating.
//!
//! Tokens: `%parent` (all ancestor dirs), `%parent_N` (nearest N ancestors),
//! `%file` (file stem).

use std::sync::LazyLock;

use regex::Regex;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%parent_(\d+)|%parent|%file").expect("valid regex"));

/// Render a prefix template for one source file.
///
/// `parents` are the directory names between the source root and the file,
/// outermost first. A token that renders empty takes one adjacent `-` of the
/// template with it; every other dash is kept.
pub fn render_title_prefix(template: &str, parents: &[String], file_stem: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in TOKEN_RE.captures_iter(template) {
        let Some(token) = caps.get(0) else { continue };
        let literal = &template[last..token.start()];
        out.push_str(literal);
        last = token.end();

        let value = if let Some(n) = caps.get(1) {
            let n: usize = n.as_str().parse().unwrap_or(usize::MAX);
            let start = parents.len().saturating_sub(n);
            parents[start..].join("-")
        } else if token.as_str() == "%file" {
            file_stem.to_string()
        } else {
            parents.join("-")
        };

        if !value.is_empty() {
            out.push_str(&value);
        } else if template[last..].starts_with('-') {
            last += 1;
        } else if literal.ends_with('-') {
            out.pop();
        }
    }
    out.push_str(&template[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parent_joins_all_ancestors() {
        let p = render_title_prefix("%parent", &dirs(&["docs", "a"]), "b");
        assert_eq!(p, "docs-a");
    }

    #[test]
    fn parent_n_takes_nearest() {
        let parents = dirs(&["x", "y", "z"]);
        assert_eq!(render_title_prefix("%parent_1", &parents, "f"), "z");
        assert_eq!(render_title_prefix("%parent_2", &parents, "f"), "y-z");
        assert_eq!(render_title_prefix("%parent_9", &parents, "f"), "x-y-z");
    }

    #[test]
    fn file_and_literal() {
        let p = render_title_prefix("manual-%file", &[], "guide");
        assert_eq!(p, "manual-guide");
        assert_eq!(render_title_prefix("root", &dirs(&["a"]), "b"), "root");
    }

    #[test]
    fn root_level_file_has_empty_parent() {
        assert_eq!(render_title_prefix("%parent", &[], "readme"), "");
        assert_eq!(render_title_prefix("%parent-%file", &[], "readme"), "readme");
        assert_eq!(render_title_prefix("kb-%parent", &[], "readme"), "kb");
        assert_eq!(render_title_prefix("kb-%parent-%file", &[], "readme"), "kb-readme");
    }

    #[test]
    fn literal_and_directory_dashes_survive() {
        assert_eq!(render_title_prefix("-drafts", &[], "notes"), "-drafts");
        assert_eq!(render_title_prefix("%parent", &dirs(&["-wip"]), "notes"), "-wip");
        assert_eq!(render_title_prefix("%file-", &[], "notes"), "notes-");
        assert_eq!(render_title_prefix("%parent-drafts-", &[], "notes"), "drafts-");
    }
}
