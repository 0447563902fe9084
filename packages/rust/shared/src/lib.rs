//! Shared types, error model, and configuration for kbforge.
//!
//! This crate is the foundation depended on by all other kbforge crates.
//! It provides:
//! - [`KbForgeError`]: the unified error type
//! - Domain types ([`HeadingLine`], [`ContentBlock`], [`QaRecord`], [`KbInfo`], [`DocTreeNode`])
//! - Configuration ([`AppConfig`], [`ServiceConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ClassifierKind, DefaultsConfig, ReconcileConfig, ServiceConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use error::{KbForgeError, Result};
pub use types::{
    ContentBlock, DocTreeNode, FileEntry, HeadingLine, KB_INFO_FILE_NAME, KNOWLEDGE_DB_FILE_NAME,
    KbInfo, QaRecord, TocItem,
};
