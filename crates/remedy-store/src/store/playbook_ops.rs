//! Playbook CRUD and trigger lookups.

use rusqlite::{OptionalExtension, Row, params};
use tracing::debug;
use uuid::Uuid;

use remedy_types::{Playbook, now};

use super::{Store, col_json, col_ts, col_uuid, ts};
use crate::error::{Result, StoreError};

const PLAYBOOK_COLUMNS: &str = "id, name, namespace, spec, created_at, updated_at";

impl Store {
    /// Insert or replace a playbook, keyed on `(namespace, name)`.
    ///
    /// An existing row keeps its id and creation time. Returns the stored
    /// playbook.
    pub fn upsert_playbook(&self, playbook: &Playbook) -> Result<Playbook> {
        playbook.validate()?;
        let spec = serde_json::to_string(&playbook.spec)?;
        let updated_at = now();

        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO playbooks (id, name, namespace, spec, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (namespace, name) DO UPDATE SET
                spec = excluded.spec,
                updated_at = excluded.updated_at,
                deleted_at = NULL
            "#,
            params![
                playbook.id.to_string(),
                playbook.name,
                playbook.namespace,
                spec,
                ts(&playbook.created_at),
                ts(&updated_at),
            ],
        )?;

        let stored = conn.query_row(
            &format!(
                "SELECT {PLAYBOOK_COLUMNS} FROM playbooks WHERE namespace = ?1 AND name = ?2"
            ),
            params![playbook.namespace, playbook.name],
            row_to_playbook,
        )?;
        debug!(playbook = %stored.name, id = %stored.id, "Upserted playbook");
        Ok(stored)
    }

    pub fn get_playbook(&self, id: Uuid) -> Result<Option<Playbook>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {PLAYBOOK_COLUMNS} FROM playbooks WHERE id = ?1 AND deleted_at IS NULL"
                ),
                params![id.to_string()],
                row_to_playbook,
            )
            .optional()?)
    }

    pub fn get_playbook_by_name(&self, namespace: &str, name: &str) -> Result<Option<Playbook>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {PLAYBOOK_COLUMNS} FROM playbooks
                     WHERE namespace = ?1 AND name = ?2 AND deleted_at IS NULL"
                ),
                params![namespace, name],
                row_to_playbook,
            )
            .optional()?)
    }

    /// All live playbooks, ordered by name.
    pub fn list_playbooks(&self) -> Result<Vec<Playbook>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PLAYBOOK_COLUMNS} FROM playbooks WHERE deleted_at IS NULL ORDER BY namespace, name"
        ))?;
        let rows = stmt.query_map([], row_to_playbook)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Soft-delete a playbook. Existing runs keep referencing it.
    pub fn delete_playbook(&self, id: Uuid) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE playbooks SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![id.to_string(), ts(&now())],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("playbook {id}")));
        }
        Ok(())
    }

    /// Playbooks with a trigger for `class.event`.
    pub fn find_playbooks_for_event(&self, class: &str, event: &str) -> Result<Vec<Playbook>> {
        Ok(self
            .list_playbooks()?
            .into_iter()
            .filter(|p| p.spec.on.for_class(class).iter().any(|t| t.event == event))
            .collect())
    }

    /// The playbook whose webhook trigger is mounted at `path`.
    pub fn find_playbook_by_webhook(&self, path: &str) -> Result<Option<Playbook>> {
        let path = path.trim_matches('/');
        Ok(self.list_playbooks()?.into_iter().find(|p| {
            p.spec
                .on
                .webhook
                .as_ref()
                .is_some_and(|w| w.path.trim_matches('/') == path)
        }))
    }
}

fn row_to_playbook(row: &Row<'_>) -> rusqlite::Result<Playbook> {
    Ok(Playbook {
        id: col_uuid(row, 0)?,
        name: row.get(1)?,
        namespace: row.get(2)?,
        spec: col_json(row, 3)?,
        created_at: col_ts(row, 4)?,
        updated_at: col_ts(row, 5)?,
    })
}
