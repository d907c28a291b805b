//! Durable event queue.
//!
//! A claim leases a batch of events for [`EVENT_LEASE_SECS`]; leased events are
//! invisible to other consumers until they are deleted (success), released
//! with a retry time (failure), or the lease runs out (consumer crashed).

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, Row, TransactionBehavior, params};
use tracing::debug;
use uuid::Uuid;

use remedy_types::{Event, now};

use super::{Store, col_json, col_opt_ts, col_ts, col_uuid, opt_ts, placeholders, ts};
use crate::error::Result;

const EVENT_COLUMNS: &str =
    "id, name, properties, priority, attempts, last_attempt, error, created_at";

/// How long a claimed event stays invisible to other consumers.
pub const EVENT_LEASE_SECS: i64 = 300;

impl Store {
    /// Append an event to the queue.
    pub fn publish_event(&self, event: &Event) -> Result<()> {
        insert_event(&self.conn(), event)?;
        debug!(event_id = %event.id, name = %event.name, "Published event");
        Ok(())
    }

    /// Claim up to `limit` due events with fewer than `max_attempts`
    /// attempts, highest priority first, then insertion order.
    pub fn claim_events(&self, limit: usize, max_attempts: u32) -> Result<Vec<Event>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let at = now();

        let events = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM event_queue
                 WHERE attempts < ?2
                   AND (claimed_until IS NULL OR claimed_until <= ?1)
                   AND (next_attempt IS NULL OR next_attempt <= ?1)
                 ORDER BY priority DESC, created_at, rowid
                 LIMIT ?3"
            ))?;
            stmt.query_map(params![ts(&at), max_attempts, limit as i64], row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        if !events.is_empty() {
            let sql = format!(
                "UPDATE event_queue SET claimed_until = ? WHERE id IN ({})",
                placeholders(events.len())
            );
            let mut args = vec![ts(&(at + Duration::seconds(EVENT_LEASE_SECS)))];
            args.extend(events.iter().map(|e| e.id.to_string()));
            tx.execute(&sql, rusqlite::params_from_iter(args))?;
        }
        tx.commit()?;
        Ok(events)
    }

    /// Remove a successfully processed event.
    pub fn delete_event(&self, id: Uuid) -> Result<()> {
        self.conn()
            .execute("DELETE FROM event_queue WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    /// Release a failed event: bump `attempts`, record the error and make it
    /// claimable again at `retry_at`.
    pub fn fail_event(&self, id: Uuid, error: &str, retry_at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE event_queue
             SET attempts = attempts + 1, last_attempt = ?2, error = ?3,
                 next_attempt = ?4, claimed_until = NULL
             WHERE id = ?1",
            params![id.to_string(), ts(&now()), error, ts(&retry_at)],
        )?;
        Ok(())
    }

    /// Events that exhausted their attempts.
    pub fn dead_events(&self, max_attempts: u32) -> Result<Vec<Event>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM event_queue WHERE attempts >= ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![max_attempts], row_to_event)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_events(&self) -> Result<usize> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM event_queue", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

pub(super) fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO event_queue ({EVENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ),
        params![
            event.id.to_string(),
            event.name,
            serde_json::to_string(&event.properties)?,
            event.priority,
            event.attempts,
            opt_ts(&event.last_attempt),
            event.error,
            ts(&event.created_at),
        ],
    )?;
    Ok(())
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: col_uuid(row, 0)?,
        name: row.get(1)?,
        properties: col_json(row, 2)?,
        priority: row.get(3)?,
        attempts: row.get(4)?,
        last_attempt: col_opt_ts(row, 5)?,
        error: row.get(6)?,
        created_at: col_ts(row, 7)?,
    })
}
