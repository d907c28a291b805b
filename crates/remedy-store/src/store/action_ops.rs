//! Run action records.

use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use uuid::Uuid;

use remedy_types::{ActionStatus, AgentData, Run, RunAction};

use super::{
    Store, col_json, col_opt_json, col_opt_ts, col_opt_uuid, col_parse, col_ts, col_uuid, opt_ts,
    opt_uuid, placeholders, ts,
};
use crate::error::{Result, StoreError};

const ACTION_COLUMNS: &str = "id, run_id, name, status, scheduled_time, start_time, end_time, \
     result, error, agent_id, is_pushed";

impl Store {
    pub fn insert_action(&self, action: &RunAction) -> Result<()> {
        let result = action.result.as_ref().map(serde_json::to_string).transpose()?;
        self.conn().execute(
            &format!(
                "INSERT INTO playbook_run_actions ({ACTION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                action.id.to_string(),
                action.run_id.to_string(),
                action.name,
                action.status.as_str(),
                ts(&action.scheduled_time),
                opt_ts(&action.start_time),
                opt_ts(&action.end_time),
                result,
                action.error,
                opt_uuid(&action.agent_id),
                action.is_pushed,
            ],
        )?;
        Ok(())
    }

    /// Insert or overwrite an action by id. Pushed agent results land here.
    pub fn upsert_action(&self, action: &RunAction) -> Result<()> {
        let result = action.result.as_ref().map(serde_json::to_string).transpose()?;
        self.conn().execute(
            &format!(
                "INSERT INTO playbook_run_actions ({ACTION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT (id) DO UPDATE SET
                    status = excluded.status,
                    start_time = excluded.start_time,
                    end_time = excluded.end_time,
                    result = excluded.result,
                    error = excluded.error,
                    is_pushed = excluded.is_pushed"
            ),
            params![
                action.id.to_string(),
                action.run_id.to_string(),
                action.name,
                action.status.as_str(),
                ts(&action.scheduled_time),
                opt_ts(&action.start_time),
                opt_ts(&action.end_time),
                result,
                action.error,
                opt_uuid(&action.agent_id),
                action.is_pushed,
            ],
        )?;
        Ok(())
    }

    /// Persist the mutable fields of an action.
    pub fn update_action(&self, action: &RunAction) -> Result<()> {
        let result = action.result.as_ref().map(serde_json::to_string).transpose()?;
        let rows = self.conn().execute(
            "UPDATE playbook_run_actions
             SET status = ?2, scheduled_time = ?3, start_time = ?4, end_time = ?5,
                 result = ?6, error = ?7, agent_id = ?8, is_pushed = ?9
             WHERE id = ?1",
            params![
                action.id.to_string(),
                action.status.as_str(),
                ts(&action.scheduled_time),
                opt_ts(&action.start_time),
                opt_ts(&action.end_time),
                result,
                action.error,
                opt_uuid(&action.agent_id),
                action.is_pushed,
            ],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("action {}", action.id)));
        }
        Ok(())
    }

    pub fn get_action(&self, id: Uuid) -> Result<Option<RunAction>> {
        get_action(&self.conn(), id)
    }

    pub fn get_action_by_name(&self, run_id: Uuid, name: &str) -> Result<Option<RunAction>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {ACTION_COLUMNS} FROM playbook_run_actions
                     WHERE run_id = ?1 AND name = ?2"
                ),
                params![run_id.to_string(), name],
                row_to_action,
            )
            .optional()?)
    }

    /// Actions of a run in execution order.
    pub fn list_actions(&self, run_id: Uuid) -> Result<Vec<RunAction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACTION_COLUMNS} FROM playbook_run_actions
             WHERE run_id = ?1 ORDER BY scheduled_time, rowid"
        ))?;
        let rows = stmt.query_map(params![run_id.to_string()], row_to_action)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The action a sleeping run resumes on.
    pub fn sleeping_action(&self, run_id: Uuid) -> Result<Option<RunAction>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {ACTION_COLUMNS} FROM playbook_run_actions
                     WHERE run_id = ?1 AND status = 'sleeping'
                     ORDER BY scheduled_time LIMIT 1"
                ),
                params![run_id.to_string()],
                row_to_action,
            )
            .optional()?)
    }

    /// Hand out one action delegated to `agent_id`, moving it
    /// `scheduled_on_agent -> running` so no other pull receives it.
    pub fn claim_agent_action(
        &self,
        agent_id: Uuid,
    ) -> Result<Option<(Run, RunAction, AgentData)>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT a.id FROM playbook_run_actions a
                 JOIN playbook_runs r ON r.id = a.run_id
                 WHERE a.status = 'scheduled_on_agent'
                   AND COALESCE(a.agent_id, r.agent_id) = ?1
                 ORDER BY a.scheduled_time LIMIT 8",
            )?;
            stmt.query_map(params![agent_id.to_string()], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        for candidate in candidates {
            let rows = tx.execute(
                "UPDATE playbook_run_actions SET status = 'running'
                 WHERE id = ?1 AND status = 'scheduled_on_agent'",
                params![candidate],
            )?;
            if rows != 1 {
                continue;
            }
            let id = Uuid::parse_str(&candidate)
                .map_err(|e| StoreError::Conflict(format!("corrupt action id: {e}")))?;
            let action =
                get_action(&tx, id)?.ok_or_else(|| StoreError::NotFound(format!("action {id}")))?;
            let run = super::run_ops::get_run(&tx, action.run_id)?
                .ok_or_else(|| StoreError::NotFound(format!("run {}", action.run_id)))?;
            let data = agent_data(&tx, id)?
                .ok_or_else(|| StoreError::NotFound(format!("agent data for action {id}")))?;
            tx.commit()?;
            return Ok(Some((run, action, data)));
        }

        tx.commit()?;
        Ok(None)
    }

    /// Terminal actions not yet pushed upstream.
    pub fn unpushed_actions(&self, limit: usize) -> Result<Vec<RunAction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACTION_COLUMNS} FROM playbook_run_actions
             WHERE is_pushed = 0
               AND status IN ('completed', 'failed', 'skipped', 'cancelled')
             ORDER BY end_time LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_action)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn mark_actions_pushed(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE playbook_run_actions SET is_pushed = 1 WHERE id IN ({})",
            placeholders(ids.len())
        );
        self.conn()
            .execute(&sql, rusqlite::params_from_iter(ids.iter().map(|id| id.to_string())))?;
        Ok(())
    }

    /// Store the spec and environment of a delegated action.
    pub fn insert_agent_data(&self, data: &AgentData) -> Result<()> {
        self.conn().execute(
            "INSERT INTO playbook_action_agent_data (action_id, run_id, spec, env)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (action_id) DO UPDATE SET spec = excluded.spec, env = excluded.env",
            params![
                data.action_id.to_string(),
                data.run_id.to_string(),
                serde_json::to_string(&data.spec)?,
                serde_json::to_string(&data.env)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_agent_data(&self, action_id: Uuid) -> Result<Option<AgentData>> {
        agent_data(&self.conn(), action_id)
    }

    /// Count actions of a run per status.
    pub fn count_actions(&self, run_id: Uuid, status: ActionStatus) -> Result<usize> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM playbook_run_actions WHERE run_id = ?1 AND status = ?2",
            params![run_id.to_string(), status.as_str()],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }
}

fn get_action(conn: &Connection, id: Uuid) -> Result<Option<RunAction>> {
    Ok(conn
        .query_row(
            &format!("SELECT {ACTION_COLUMNS} FROM playbook_run_actions WHERE id = ?1"),
            params![id.to_string()],
            row_to_action,
        )
        .optional()?)
}

fn agent_data(conn: &Connection, action_id: Uuid) -> Result<Option<AgentData>> {
    Ok(conn
        .query_row(
            "SELECT action_id, run_id, spec, env FROM playbook_action_agent_data
             WHERE action_id = ?1",
            params![action_id.to_string()],
            |row| {
                Ok(AgentData {
                    action_id: col_uuid(row, 0)?,
                    run_id: col_uuid(row, 1)?,
                    spec: col_json(row, 2)?,
                    env: col_json(row, 3)?,
                })
            },
        )
        .optional()?)
}

fn row_to_action(row: &Row<'_>) -> rusqlite::Result<RunAction> {
    Ok(RunAction {
        id: col_uuid(row, 0)?,
        run_id: col_uuid(row, 1)?,
        name: row.get(2)?,
        status: col_parse(row, 3)?,
        scheduled_time: col_ts(row, 4)?,
        start_time: col_opt_ts(row, 5)?,
        end_time: col_opt_ts(row, 6)?,
        result: col_opt_json(row, 7)?,
        error: row.get(8)?,
        agent_id: col_opt_uuid(row, 9)?,
        is_pushed: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::scheduled_run;
    use remedy_types::now;
    use serde_json::json;

    #[test]
    fn test_unique_name_per_run() {
        let store = Store::open_in_memory().unwrap();
        let (_, run) = scheduled_run(&store);
        store.insert_action(&RunAction::new(run.id, "a")).unwrap();
        assert!(store.insert_action(&RunAction::new(run.id, "a")).is_err());
    }

    #[test]
    fn test_update_and_list() {
        let store = Store::open_in_memory().unwrap();
        let (_, run) = scheduled_run(&store);
        let mut a = RunAction::new(run.id, "a");
        store.insert_action(&a).unwrap();
        store.insert_action(&RunAction::new(run.id, "b")).unwrap();

        a.status = ActionStatus::Completed;
        a.start_time = Some(now());
        a.end_time = Some(now());
        a.result = Some(json!({"stdout": "hi"}));
        store.update_action(&a).unwrap();

        let list = store.list_actions(run.id).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "a");
        assert_eq!(list[0].result.as_ref().unwrap()["stdout"], "hi");
        assert_eq!(store.count_actions(run.id, ActionStatus::Completed).unwrap(), 1);
        assert!(
            store
                .get_action_by_name(run.id, "b")
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_sleeping_action() {
        let store = Store::open_in_memory().unwrap();
        let (_, run) = scheduled_run(&store);
        let mut a = RunAction::new(run.id, "wait");
        a.status = ActionStatus::Sleeping;
        store.insert_action(&a).unwrap();
        assert_eq!(store.sleeping_action(run.id).unwrap().unwrap().id, a.id);
    }

    #[test]
    fn test_claim_agent_action_once() {
        let store = Store::open_in_memory().unwrap();
        let (pb, _) = scheduled_run(&store);
        let agent = store.get_or_create_agent("a1").unwrap();

        let mut run = Run::new(pb.id);
        run.agent_id = Some(agent.id);
        store.insert_run(&run).unwrap();
        let mut action = RunAction::new(run.id, "a");
        action.status = ActionStatus::ScheduledOnAgent;
        store.insert_action(&action).unwrap();
        store
            .insert_agent_data(&AgentData {
                run_id: run.id,
                action_id: action.id,
                spec: json!({"name": "a"}),
                env: json!({}),
            })
            .unwrap();

        let (r, a, d) = store.claim_agent_action(agent.id).unwrap().unwrap();
        assert_eq!(r.id, run.id);
        assert_eq!(a.status, ActionStatus::Running);
        assert_eq!(d.spec["name"], "a");
        assert!(store.claim_agent_action(agent.id).unwrap().is_none());
        assert!(store.claim_agent_action(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_push_bookkeeping() {
        let store = Store::open_in_memory().unwrap();
        let (_, run) = scheduled_run(&store);
        let mut done = RunAction::new(run.id, "done");
        done.status = ActionStatus::Completed;
        done.end_time = Some(now());
        store.insert_action(&done).unwrap();
        store.insert_action(&RunAction::new(run.id, "pending")).unwrap();

        let unpushed = store.unpushed_actions(10).unwrap();
        assert_eq!(unpushed.len(), 1);
        store.mark_actions_pushed(&[done.id]).unwrap();
        assert!(store.unpushed_actions(10).unwrap().is_empty());

        // Upsert is idempotent on id.
        done.error = Some("late".into());
        store.upsert_action(&done).unwrap();
        store.upsert_action(&done).unwrap();
        assert_eq!(
            store.get_action(done.id).unwrap().unwrap().error.as_deref(),
            Some("late")
        );
    }
}
