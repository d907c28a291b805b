//! Artifact metadata rows.

use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

use remedy_types::Artifact;

use super::{Store, col_ts, col_uuid, placeholders, ts};
use crate::error::Result;

const ARTIFACT_COLUMNS: &str = "id, run_action_id, path, size, content_type, checksum, \
     connection, is_pushed, is_data_pushed, created_at";

impl Store {
    /// Insert an artifact, or overwrite it when the id already exists.
    pub fn upsert_artifact(&self, artifact: &Artifact) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO artifacts ({ARTIFACT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (id) DO UPDATE SET
                    path = excluded.path,
                    size = excluded.size,
                    content_type = excluded.content_type,
                    checksum = excluded.checksum,
                    connection = excluded.connection,
                    is_pushed = excluded.is_pushed,
                    is_data_pushed = excluded.is_data_pushed"
            ),
            params![
                artifact.id.to_string(),
                artifact.run_action_id.to_string(),
                artifact.path,
                artifact.size as i64,
                artifact.content_type,
                artifact.checksum,
                artifact.connection,
                artifact.is_pushed,
                artifact.is_data_pushed,
                ts(&artifact.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE id = ?1"),
                params![id.to_string()],
                row_to_artifact,
            )
            .optional()?)
    }

    pub fn list_artifacts(&self, run_action_id: Uuid) -> Result<Vec<Artifact>> {
        self.query_artifacts(
            "WHERE run_action_id = ?1 ORDER BY created_at",
            &[&run_action_id.to_string()],
        )
    }

    /// Artifact rows not yet pushed upstream.
    pub fn unpushed_artifacts(&self, limit: usize) -> Result<Vec<Artifact>> {
        self.query_artifacts(
            "WHERE is_pushed = 0 ORDER BY created_at LIMIT ?1",
            &[&(limit as i64)],
        )
    }

    /// Pushed rows whose content has not been streamed upstream yet.
    pub fn artifacts_pending_data(&self, limit: usize) -> Result<Vec<Artifact>> {
        self.query_artifacts(
            "WHERE is_pushed = 1 AND is_data_pushed = 0 ORDER BY created_at LIMIT ?1",
            &[&(limit as i64)],
        )
    }

    pub fn mark_artifacts_pushed(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE artifacts SET is_pushed = 1 WHERE id IN ({})",
            placeholders(ids.len())
        );
        self.conn()
            .execute(&sql, rusqlite::params_from_iter(ids.iter().map(|id| id.to_string())))?;
        Ok(())
    }

    pub fn mark_artifact_data_pushed(&self, id: Uuid) -> Result<()> {
        self.conn().execute(
            "UPDATE artifacts SET is_data_pushed = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    fn query_artifacts(
        &self,
        clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Artifact>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts {clause}"))?;
        let rows = stmt.query_map(args, row_to_artifact)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn row_to_artifact(row: &Row<'_>) -> rusqlite::Result<Artifact> {
    Ok(Artifact {
        id: col_uuid(row, 0)?,
        run_action_id: col_uuid(row, 1)?,
        path: row.get(2)?,
        size: row.get::<_, i64>(3)? as u64,
        content_type: row.get(4)?,
        checksum: row.get(5)?,
        connection: row.get(6)?,
        is_pushed: row.get(7)?,
        is_data_pushed: row.get(8)?,
        created_at: col_ts(row, 9)?,
    })
}
