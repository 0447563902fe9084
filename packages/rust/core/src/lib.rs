//! Ingestion core for kbforge.
//!
//! Ties extractors, heading reconciliation, section building, and the
//! persistent stores into the [`pipeline::ingest`] workflow.

pub mod client;
pub mod extract;
pub mod pages;
pub mod pipeline;
pub mod reconcile;
pub mod response;

pub use client::ChatClient;
pub use extract::{ExtractorRegistry, ImageDescriber, load_ignore_file};
pub use pipeline::{CancelFlag, FileStatus, IngestConfig, IngestReport, ProgressReporter, SilentProgress, ingest};
pub use reconcile::{HeadingClassifier, LlmClassifier, OutlineClassifier};
