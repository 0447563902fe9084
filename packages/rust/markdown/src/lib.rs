//! Markdown-level building blocks for kbforge.
//!
//! - [`headings`]: heading stream contract (parse, render, fence tracking, ids)
//! - [`sections`]: the section tree builder turning a leveled stream into tagged blocks
//! - [`prefix`]: title prefix templating from the directory hierarchy
//! - [`tags`]: provenance tags around emitted content
//! - [`convert`]: HTML to Markdown

mod cleanup;
pub mod convert;
pub mod headings;
pub mod prefix;
pub mod sections;
pub mod tags;

pub use convert::{html_title, html_to_markdown};
pub use headings::{
    FenceTracker, ID_MARKER, attach_heading_ids, count_top_level, escape_block_markers, headings,
    parse_heading, render_heading, starts_with_top_level,
};
pub use prefix::render_title_prefix;
pub use sections::{SectionOptions, SectionSource, SectionTree, build_sections};
pub use tags::{resource_tag, section_tag};
