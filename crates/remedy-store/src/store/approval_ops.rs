//! Run approvals.

use rusqlite::{Connection, TransactionBehavior, params};
use uuid::Uuid;

use remedy_types::{Approval, RunStatus};

use super::run_ops::get_run;
use super::{Store, col_opt_uuid, col_ts, col_uuid, opt_uuid, ts};
use crate::error::{Result, StoreError};

impl Store {
    pub fn insert_approval(&self, approval: &Approval) -> Result<()> {
        insert_approval(&self.conn(), approval)
    }

    /// Record `approval` while its run is still pending, unless the same
    /// approver already has. Returns every approval of the run, all in one
    /// transaction.
    pub fn record_approval(&self, approval: &Approval) -> Result<Vec<Approval>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let run = get_run(&tx, approval.run_id)?
            .ok_or_else(|| StoreError::NotFound(format!("run {}", approval.run_id)))?;
        if run.status != RunStatus::Pending {
            return Err(StoreError::Conflict(format!(
                "run {} is {}, not pending approval",
                run.id, run.status
            )));
        }
        let mut approvals = list_approvals(&tx, approval.run_id)?;
        let duplicate = approvals
            .iter()
            .any(|a| a.person_id == approval.person_id && a.team_id == approval.team_id);
        if !duplicate {
            insert_approval(&tx, approval)?;
            approvals.push(approval.clone());
        }
        tx.commit()?;
        Ok(approvals)
    }

    pub fn list_approvals(&self, run_id: Uuid) -> Result<Vec<Approval>> {
        list_approvals(&self.conn(), run_id)
    }
}

fn insert_approval(conn: &Connection, approval: &Approval) -> Result<()> {
    conn.execute(
        "INSERT INTO playbook_approvals (id, run_id, person_id, team_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            approval.id.to_string(),
            approval.run_id.to_string(),
            opt_uuid(&approval.person_id),
            opt_uuid(&approval.team_id),
            ts(&approval.created_at),
        ],
    )?;
    Ok(())
}

fn list_approvals(conn: &Connection, run_id: Uuid) -> Result<Vec<Approval>> {
    let mut stmt = conn.prepare(
        "SELECT id, run_id, person_id, team_id, created_at FROM playbook_approvals
         WHERE run_id = ?1 ORDER BY created_at",
    )?;
    let rows = stmt.query_map(params![run_id.to_string()], |row| {
        Ok(Approval {
            id: col_uuid(row, 0)?,
            run_id: col_uuid(row, 1)?,
            person_id: col_opt_uuid(row, 2)?,
            team_id: col_opt_uuid(row, 3)?,
            created_at: col_ts(row, 4)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
