//! Run persistence and the run state machine.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::debug;
use uuid::Uuid;

use remedy_types::{Run, RunStatus, now};

use super::{
    Store, col_json, col_opt_json, col_opt_ts, col_opt_uuid, col_parse, col_ts, col_uuid, opt_ts,
    opt_uuid, ts,
};
use crate::error::{Result, StoreError};

const RUN_COLUMNS: &str = "id, playbook_id, config_id, component_id, check_id, parameters, \
     status, scheduled_time, start_time, end_time, agent_id, created_by, request, error, created_at";

/// How many due runs to inspect per claim attempt.
const CLAIM_WINDOW: i64 = 32;

impl Store {
    pub fn insert_run(&self, run: &Run) -> Result<()> {
        let conn = self.conn();
        insert_run(&conn, run)?;
        debug!(run_id = %run.id, status = %run.status, "Inserted run");
        Ok(())
    }

    /// Insert several runs atomically: either all are stored or none.
    pub fn insert_runs(&self, runs: &[Run]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for run in runs {
            insert_run(&tx, run)?;
        }
        tx.commit()?;
        debug!(runs = runs.len(), "Inserted runs");
        Ok(())
    }

    /// Insert or replace a run by id (used when an agent mirrors host runs).
    pub fn upsert_run(&self, run: &Run) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO playbook_runs ({RUN_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT (id) DO UPDATE SET
                    parameters = excluded.parameters,
                    status = excluded.status,
                    scheduled_time = excluded.scheduled_time,
                    start_time = excluded.start_time,
                    end_time = excluded.end_time,
                    error = excluded.error"
            ),
            rusqlite::params_from_iter(run_params(run)?),
        )?;
        Ok(())
    }

    pub fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        get_run(&self.conn(), id)
    }

    /// Like [`get_run`](Self::get_run) but `NotFound` when missing.
    pub fn require_run(&self, id: Uuid) -> Result<Run> {
        self.get_run(id)?
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))
    }

    /// Most recent runs, optionally for one playbook.
    pub fn list_runs(&self, playbook_id: Option<Uuid>, limit: usize) -> Result<Vec<Run>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM playbook_runs
             WHERE (?1 IS NULL OR playbook_id = ?1)
             ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![playbook_id.map(|id| id.to_string()), limit as i64],
            row_to_run,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn runs_with_status(&self, status: RunStatus) -> Result<Vec<Run>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM playbook_runs WHERE status = ?1 ORDER BY scheduled_time"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], row_to_run)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Claim a specific run: `scheduled -> running` with compare-and-set.
    ///
    /// Returns `false` when another claimant got there first or the run is
    /// not due.
    pub fn claim_run(&self, id: Uuid) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let claimed = cas_claim(&tx, id, &now())?;
        tx.commit()?;
        Ok(claimed)
    }

    /// Claim the next due scheduled run not in `exclude`.
    pub fn claim_next_run(&self, exclude: &HashSet<Uuid>) -> Result<Option<Run>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let at = now();

        let candidates: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM playbook_runs
                 WHERE status = 'scheduled' AND scheduled_time <= ?1
                 ORDER BY scheduled_time LIMIT ?2",
            )?;
            stmt.query_map(params![ts(&at), CLAIM_WINDOW], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        for candidate in candidates {
            let Ok(id) = Uuid::parse_str(&candidate) else {
                continue;
            };
            if exclude.contains(&id) {
                continue;
            }
            if cas_claim(&tx, id, &at)? {
                let run = get_run(&tx, id)?;
                tx.commit()?;
                return Ok(run);
            }
        }
        tx.commit()?;
        Ok(None)
    }

    /// Move every sleeping run whose `scheduled_time` has passed back to
    /// `scheduled`. Returns the woken run ids.
    pub fn wake_sleeping_runs(&self) -> Result<Vec<Uuid>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "UPDATE playbook_runs SET status = 'scheduled'
                 WHERE status = 'sleeping' AND scheduled_time <= ?1
                 RETURNING id",
            )?;
            stmt.query_map(params![ts(&now())], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.commit()?;
        Ok(ids.iter().filter_map(|s| Uuid::parse_str(s).ok()).collect())
    }

    /// Earliest `scheduled_time` of any scheduled or sleeping run.
    pub fn next_due_time(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn();
        let next: Option<String> = conn.query_row(
            "SELECT MIN(scheduled_time) FROM playbook_runs
             WHERE status IN ('scheduled', 'sleeping')",
            [],
            |r| r.get(0),
        )?;
        Ok(next
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    /// Apply a state-machine transition with compare-and-set on the current
    /// status. Terminal transitions set `end_time`.
    pub fn transition_run(&self, id: Uuid, to: RunStatus, error: Option<&str>) -> Result<Run> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let run = transition(&tx, id, to, None, error)?;
        tx.commit()?;
        Ok(run)
    }

    /// Transition to `scheduled` with a new `scheduled_time`.
    pub fn schedule_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<Run> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let run = transition(&tx, id, RunStatus::Scheduled, Some(at), None)?;
        tx.commit()?;
        Ok(run)
    }

    /// Transition `running -> sleeping` until `until`.
    pub fn sleep_run(&self, id: Uuid, until: DateTime<Utc>) -> Result<Run> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let run = transition(&tx, id, RunStatus::Sleeping, Some(until), None)?;
        tx.commit()?;
        Ok(run)
    }

    /// Cancel a run and every non-terminal action it owns.
    pub fn cancel_run(&self, id: Uuid) -> Result<Run> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let run = transition(&tx, id, RunStatus::Cancelled, None, Some("cancelled"))?;
        tx.execute(
            "UPDATE playbook_run_actions
             SET status = 'cancelled', end_time = ?2, error = COALESCE(error, 'cancelled')
             WHERE run_id = ?1
               AND status NOT IN ('completed', 'failed', 'skipped', 'cancelled')",
            params![id.to_string(), ts(&now())],
        )?;
        tx.commit()?;
        debug!(run_id = %id, "Cancelled run");
        Ok(run)
    }
}

fn run_params(run: &Run) -> Result<Vec<Box<dyn rusqlite::ToSql>>> {
    Ok(vec![
        Box::new(run.id.to_string()),
        Box::new(run.playbook_id.to_string()),
        Box::new(opt_uuid(&run.config_id)),
        Box::new(opt_uuid(&run.component_id)),
        Box::new(opt_uuid(&run.check_id)),
        Box::new(serde_json::to_string(&run.parameters)?),
        Box::new(run.status.as_str()),
        Box::new(ts(&run.scheduled_time)),
        Box::new(opt_ts(&run.start_time)),
        Box::new(opt_ts(&run.end_time)),
        Box::new(opt_uuid(&run.agent_id)),
        Box::new(opt_uuid(&run.created_by)),
        Box::new(run.request.as_ref().map(serde_json::to_string).transpose()?),
        Box::new(run.error.clone()),
        Box::new(ts(&run.created_at)),
    ])
}

fn insert_run(conn: &Connection, run: &Run) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO playbook_runs ({RUN_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        ),
        rusqlite::params_from_iter(run_params(run)?),
    )?;
    Ok(())
}

pub(super) fn get_run(conn: &Connection, id: Uuid) -> Result<Option<Run>> {
    Ok(conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM playbook_runs WHERE id = ?1"),
            params![id.to_string()],
            row_to_run,
        )
        .optional()?)
}

fn cas_claim(conn: &Connection, id: Uuid, at: &DateTime<Utc>) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE playbook_runs SET status = 'running', start_time = ?2
         WHERE id = ?1 AND status = 'scheduled' AND scheduled_time <= ?2",
        params![id.to_string(), ts(at)],
    )?;
    Ok(rows == 1)
}

fn transition(
    conn: &Connection,
    id: Uuid,
    to: RunStatus,
    scheduled_time: Option<DateTime<Utc>>,
    error: Option<&str>,
) -> Result<Run> {
    let current = get_run(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
    current
        .status
        .check_transition(to)
        .map_err(|e| StoreError::Conflict(format!("run {id}: {e}")))?;

    let at = now();
    let end_time = to.is_terminal().then(|| ts(&at));
    let rows = conn.execute(
        "UPDATE playbook_runs
         SET status = ?3,
             scheduled_time = COALESCE(?4, scheduled_time),
             end_time = COALESCE(?5, end_time),
             error = COALESCE(?6, error)
         WHERE id = ?1 AND status = ?2",
        params![
            id.to_string(),
            current.status.as_str(),
            to.as_str(),
            scheduled_time.as_ref().map(ts),
            end_time,
            error,
        ],
    )?;
    if rows != 1 {
        return Err(StoreError::Conflict(format!(
            "run {id} changed concurrently from {}",
            current.status
        )));
    }
    debug!(run_id = %id, from = %current.status, to = %to, "Run transition");
    get_run(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("run {id}")))
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: col_uuid(row, 0)?,
        playbook_id: col_uuid(row, 1)?,
        config_id: col_opt_uuid(row, 2)?,
        component_id: col_opt_uuid(row, 3)?,
        check_id: col_opt_uuid(row, 4)?,
        parameters: col_json(row, 5)?,
        status: col_parse(row, 6)?,
        scheduled_time: col_ts(row, 7)?,
        start_time: col_opt_ts(row, 8)?,
        end_time: col_opt_ts(row, 9)?,
        agent_id: col_opt_uuid(row, 10)?,
        created_by: col_opt_uuid(row, 11)?,
        request: col_opt_json(row, 12)?,
        error: row.get(13)?,
        created_at: col_ts(row, 14)?,
    })
}
