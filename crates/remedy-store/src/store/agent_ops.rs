//! Agents known to the host.

use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

use remedy_types::{Agent, now};

use super::{Store, col_opt_ts, col_uuid, ts};
use crate::error::Result;

impl Store {
    /// Fetch the agent by name, creating it on first sight.
    pub fn get_or_create_agent(&self, name: &str) -> Result<Agent> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO agents (id, name) VALUES (?1, ?2) ON CONFLICT (name) DO NOTHING",
            params![Uuid::new_v4().to_string(), name],
        )?;
        Ok(conn.query_row(
            "SELECT id, name, last_seen FROM agents WHERE name = ?1",
            params![name],
            row_to_agent,
        )?)
    }

    /// Record a heartbeat. Creates the agent when unknown.
    pub fn touch_agent(&self, name: &str) -> Result<Agent> {
        let agent = self.get_or_create_agent(name)?;
        let seen = now();
        self.conn().execute(
            "UPDATE agents SET last_seen = ?2 WHERE id = ?1",
            params![agent.id.to_string(), ts(&seen)],
        )?;
        Ok(Agent {
            last_seen: Some(seen),
            ..agent
        })
    }

    pub fn get_agent(&self, id: Uuid) -> Result<Option<Agent>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, name, last_seen FROM agents WHERE id = ?1",
                params![id.to_string()],
                row_to_agent,
            )
            .optional()?)
    }

    pub fn get_agent_by_name(&self, name: &str) -> Result<Option<Agent>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, name, last_seen FROM agents WHERE name = ?1",
                params![name],
                row_to_agent,
            )
            .optional()?)
    }
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: col_uuid(row, 0)?,
        name: row.get(1)?,
        last_seen: col_opt_ts(row, 2)?,
    })
}
