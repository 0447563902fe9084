//! SQL migration definitions for the knowledge database.
//!
//! Migrations are applied in order on database open.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: qa_records",
        sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per emitted content block; knowledge_path is the replace key.
CREATE TABLE IF NOT EXISTS qa_records (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    knowledge_path TEXT NOT NULL,
    position       INTEGER NOT NULL,
    simple_title   TEXT NOT NULL,
    full_title     TEXT NOT NULL,
    content        TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_qa_records_path ON qa_records(knowledge_path, position);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
