//! Persistent state for a kbforge knowledge base.
//!
//! - [`KnowledgeStore`]: libSQL table of [`QaRecord`]s, replaced per source file
//! - [`DocTreeState`]: `kb_info.json` mirror of the source tree with per-file mtimes
//!
//! Each run is the sole writer of both; concurrent runs against the same
//! knowledge base need external locking.

mod doctree;
mod migrations;

use std::path::Path;

use chrono::Utc;
use kbforge_shared::{KbForgeError, QaRecord, Result};
use libsql::{Connection, Database, params};
use tracing::{debug, instrument};

pub use doctree::DocTreeState;

fn storage_err(e: impl std::fmt::Display) -> KbForgeError {
    KbForgeError::Storage(e.to_string())
}

/// Knowledge table handle wrapping a libSQL database.
pub struct KnowledgeStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl KnowledgeStore {
    /// Open or create the database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KbForgeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let store = Self { db, conn };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    KbForgeError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 before the first migration.
    async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    /// Replace every record of `knowledge_path` with `records`, atomically.
    ///
    /// Records are stamped with `knowledge_path` regardless of their own
    /// field. Other paths are untouched. Returns the number of rows written.
    #[instrument(skip_all, fields(path = %knowledge_path, records = records.len()))]
    pub async fn replace_file(&self, knowledge_path: &str, records: &[QaRecord]) -> Result<usize> {
        let tx = self.conn.transaction().await.map_err(storage_err)?;

        let removed = tx
            .execute(
                "DELETE FROM qa_records WHERE knowledge_path = ?1",
                params![knowledge_path],
            )
            .await
            .map_err(storage_err)?;

        let now = Utc::now().to_rfc3339();
        for (position, record) in records.iter().enumerate() {
            tx.execute(
                "INSERT INTO qa_records
                    (knowledge_path, position, simple_title, full_title, content, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    knowledge_path,
                    position as i64,
                    record.simple_title.as_str(),
                    record.full_title.as_str(),
                    record.content.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        debug!(removed, inserted = records.len(), "replaced records");
        Ok(records.len())
    }

    /// Records of one source file, in emission order.
    pub async fn records_for(&self, knowledge_path: &str) -> Result<Vec<QaRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT simple_title, full_title, content, knowledge_path FROM qa_records
                 WHERE knowledge_path = ?1 ORDER BY position",
                params![knowledge_path],
            )
            .await
            .map_err(storage_err)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    /// Every record, grouped by source path.
    pub async fn all_records(&self) -> Result<Vec<QaRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT simple_title, full_title, content, knowledge_path FROM qa_records
                 ORDER BY knowledge_path, position",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    /// Record count per knowledge path, sorted by path.
    pub async fn count_by_path(&self) -> Result<Vec<(String, u64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT knowledge_path, COUNT(*) FROM qa_records
                 GROUP BY knowledge_path ORDER BY knowledge_path",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut counts = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let path = row.get::<String>(0).map_err(storage_err)?;
            let count = row.get::<u64>(1).map_err(storage_err)?;
            counts.push((path, count));
        }
        Ok(counts)
    }

    /// Total number of records.
    pub async fn count(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM qa_records", params![])
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => row.get::<u64>(0).map_err(storage_err),
            None => Ok(0),
        }
    }
}

fn row_to_record(row: &libsql::Row) -> Result<QaRecord> {
    Ok(QaRecord {
        simple_title: row.get::<String>(0).map_err(storage_err)?,
        full_title: row.get::<String>(1).map_err(storage_err)?,
        content: row.get::<String>(2).map_err(storage_err)?,
        knowledge_path: row.get::<String>(3).map_err(storage_err)?,
    })
}
