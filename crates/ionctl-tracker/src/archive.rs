//! SQLite archive of finished experiment runs.
//!
//! # Storage layout
//!
//! | column       | type | description                                  |
//! |--------------|------|----------------------------------------------|
//! | id           | TEXT | experiment UUID, primary key                 |
//! | parent_id    | TEXT | parent experiment (NULL for top-level runs)  |
//! | status       | TEXT | `completed`, `failed` or `aborted`           |
//! | created_at   | TEXT | RFC-3339 creation timestamp (UTC)            |
//! | completed_at | TEXT | RFC-3339 completion timestamp (UTC)          |
//! | record       | TEXT | full [`ExperimentContext`] as JSON            |

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::debug;

use crate::context::ExperimentContext;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("experiment {0} is still active")]
    NotTerminal(String),
}

/// Append-mostly store of terminal [`ExperimentContext`]s.
pub struct ExperimentArchive {
    conn: Connection,
}

impl ExperimentArchive {
    /// Open (or create) an archive at `path`.
    pub fn open(path: &str) -> Result<Self, ArchiveError> {
        let archive = Self {
            conn: Connection::open(path)?,
        };
        archive.init_schema()?;
        Ok(archive)
    }

    pub fn open_in_memory() -> Result<Self, ArchiveError> {
        let archive = Self {
            conn: Connection::open_in_memory()?,
        };
        archive.init_schema()?;
        Ok(archive)
    }

    fn init_schema(&self) -> Result<(), ArchiveError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS experiments (
                id           TEXT NOT NULL PRIMARY KEY,
                parent_id    TEXT,
                status       TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                completed_at TEXT,
                record       TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Store a terminal context. Re-archiving the same id replaces the row.
    pub fn archive(&self, ctx: &ExperimentContext) -> Result<(), ArchiveError> {
        if !ctx.is_terminal() {
            return Err(ArchiveError::NotTerminal(ctx.id().to_string()));
        }
        let record = serde_json::to_string(ctx)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO experiments (id, parent_id, status, created_at, completed_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                ctx.id(),
                ctx.parent_id(),
                ctx.status().as_str(),
                ctx.created_at().to_rfc3339(),
                ctx.completed_at().map(|t| t.to_rfc3339()),
                record,
            ],
        )?;
        debug!(exp_id = %ctx.id(), status = ctx.status().as_str(), "experiment archived");
        Ok(())
    }

    /// Archive every terminal context in `contexts`; returns how many were
    /// stored. Active contexts are skipped.
    pub fn archive_terminal<'a>(
        &self,
        contexts: impl IntoIterator<Item = &'a ExperimentContext>,
    ) -> Result<usize, ArchiveError> {
        let mut stored = 0;
        for ctx in contexts.into_iter().filter(|c| c.is_terminal()) {
            self.archive(ctx)?;
            stored += 1;
        }
        Ok(stored)
    }

    pub fn get(&self, id: &str) -> Result<Option<ExperimentContext>, ArchiveError> {
        let record: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM experiments WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        record
            .map(|r| serde_json::from_str(&r).map_err(ArchiveError::from))
            .transpose()
    }

    /// Ids of archived children of `parent_id`, oldest first.
    pub fn children(&self, parent_id: &str) -> Result<Vec<String>, ArchiveError> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM experiments WHERE parent_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![parent_id], |row| row.get(0))?;
        rows.collect::<Result<Vec<String>, _>>().map_err(ArchiveError::Sqlite)
    }

    pub fn count(&self) -> Result<usize, ArchiveError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM experiments", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ionctl_types::ParamMap;

    fn finished(parent: Option<&str>) -> ExperimentContext {
        let mut ctx = ExperimentContext::new(ParamMap::new());
        if let Some(p) = parent {
            ctx = ctx.with_parent(p);
        }
        ctx.start().unwrap();
        ctx.add_result("pmt", serde_json::json!({"counts": 42}));
        ctx.complete().unwrap();
        ctx
    }

    #[test]
    fn archived_context_round_trips() {
        let archive = ExperimentArchive::open_in_memory().unwrap();
        let ctx = finished(None);
        archive.archive(&ctx).unwrap();
        let loaded = archive.get(ctx.id()).unwrap().unwrap();
        assert_eq!(loaded, ctx);
        assert_eq!(archive.count().unwrap(), 1);
    }

    #[test]
    fn active_context_is_refused() {
        let archive = ExperimentArchive::open_in_memory().unwrap();
        let ctx = ExperimentContext::new(ParamMap::new());
        assert!(matches!(archive.archive(&ctx), Err(ArchiveError::NotTerminal(_))));
    }

    #[test]
    fn archive_terminal_skips_active() {
        let archive = ExperimentArchive::open_in_memory().unwrap();
        let active = ExperimentContext::new(ParamMap::new());
        let done = finished(None);
        assert_eq!(archive.archive_terminal([&active, &done]).unwrap(), 1);
        assert!(archive.get(active.id()).unwrap().is_none());
    }

    #[test]
    fn children_are_listed_by_parent() {
        let archive = ExperimentArchive::open_in_memory().unwrap();
        let a = finished(Some("sweep-1"));
        let b = finished(Some("sweep-1"));
        let other = finished(Some("sweep-2"));
        archive.archive_terminal([&a, &b, &other]).unwrap();
        let kids = archive.children("sweep-1").unwrap();
        assert_eq!(kids.len(), 2);
        assert!(kids.contains(&a.id().to_string()));
    }

    #[test]
    fn file_backed_archive_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.db");
        let path = path.to_str().unwrap();
        let ctx = finished(None);
        {
            let archive = ExperimentArchive::open(path).unwrap();
            archive.archive(&ctx).unwrap();
        }
        let reopened = ExperimentArchive::open(path).unwrap();
        assert!(reopened.get(ctx.id()).unwrap().is_some());
    }
}
