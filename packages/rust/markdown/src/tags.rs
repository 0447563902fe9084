//! Provenance tags wrapped around emitted content.

/// Wrap content with the source path and its heading chain or position.
pub fn section_tag(knowledge_path: &str, position: &str, content: &str) -> String {
    format!("\n@section: {knowledge_path}: {position}\n\n{content}\n@endsection\n")
}

/// Wrap a side resource (image description, attachment) extracted from a source.
pub fn resource_tag(knowledge_path: &str, resource: &str, content: &str) -> String {
    format!("\n@resource: {knowledge_path}: {resource}\n\n{content}\n@endresource\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_tag_format() {
        let tagged = section_tag("docs/a.md", "Intro-Setup", "body");
        assert_eq!(
            tagged,
            "\n@section: docs/a.md: Intro-Setup\n\nbody\n@endsection\n"
        );
    }

    #[test]
    fn resource_tag_format() {
        let tagged = resource_tag("img/x.png", "image", "a chart");
        assert!(tagged.starts_with("\n@resource: img/x.png: image\n"));
        assert!(tagged.ends_with("@endresource\n"));
    }
}
