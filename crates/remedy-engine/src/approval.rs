//! Approval gate for runs of playbooks with approvers.
//!
//! A run of such a playbook starts `pending`. Each approval is checked
//! against the playbook's approvers: the caller must be a listed person (by
//! email) or a member of a listed team (by name). Once the policy is
//! satisfied the run is scheduled immediately.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use remedy_store::{Store, StoreError};
use remedy_types::{
    Approval, ApprovalSpec, ApprovalType, Playbook, Principal, Run, RunStatus, channels, now,
};

use crate::error::{EngineError, Result};
use crate::notifier::Notifier;

/// Records approvals and rejections.
pub struct ApprovalGate {
    store: Arc<Store>,
    notifier: Notifier,
}

impl ApprovalGate {
    pub fn new(store: Arc<Store>, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// Approve a pending run as `principal`. Returns the run, `scheduled`
    /// if this approval satisfied the policy.
    pub fn approve(&self, playbook_id: Uuid, run_id: Uuid, principal: &Principal) -> Result<Run> {
        let (playbook, run) = self.pending(playbook_id, run_id)?;
        let policy = policy(&playbook)?;
        let approval = eligible(policy, run.id, principal)?;

        let approvals = match self.store.record_approval(&approval) {
            Ok(approvals) => approvals,
            Err(StoreError::Conflict(reason)) => return self.already_approved(run.id, reason),
            Err(e) => return Err(EngineError::from_store(e)),
        };
        info!(run_id = %run.id, approver = %principal.email(), "Approval recorded");
        if !self.satisfied(policy, &approvals)? {
            return Ok(run);
        }
        self.schedule(&playbook, run.id)
    }

    /// Move an approved run to `scheduled`. A concurrent approval that got
    /// there first is not an error.
    fn schedule(&self, playbook: &Playbook, run_id: Uuid) -> Result<Run> {
        match self.store.schedule_run(run_id, now()) {
            Ok(scheduled) => {
                self.notifier.publish(channels::RUN_UPDATED);
                info!(run_id = %run_id, playbook = %playbook.name, "Run approved");
                Ok(scheduled)
            }
            Err(StoreError::Conflict(reason)) => self.already_approved(run_id, reason),
            Err(e) => Err(EngineError::from_store(e)),
        }
    }

    /// Resolve a lost race: fine if the run left `pending` by approval,
    /// a conflict if it is still pending or was cancelled.
    fn already_approved(&self, run_id: Uuid, reason: String) -> Result<Run> {
        let current = self
            .store
            .require_run(run_id)
            .map_err(EngineError::from_store)?;
        if matches!(current.status, RunStatus::Pending | RunStatus::Cancelled) {
            return Err(EngineError::Conflict(reason));
        }
        debug!(run_id = %run_id, status = %current.status, "Run already approved");
        Ok(current)
    }

    /// Reject a pending run as `principal`; the run is cancelled.
    pub fn reject(&self, playbook_id: Uuid, run_id: Uuid, principal: &Principal) -> Result<Run> {
        let (playbook, run) = self.pending(playbook_id, run_id)?;
        eligible(policy(&playbook)?, run.id, principal)?;

        let cancelled = self
            .store
            .transition_run(run.id, RunStatus::Cancelled, Some("rejected"))
            .map_err(EngineError::from_store)?;
        self.notifier.publish(channels::RUN_UPDATED);
        info!(run_id = %run.id, approver = %principal.email(), "Run rejected");
        Ok(cancelled)
    }

    fn pending(&self, playbook_id: Uuid, run_id: Uuid) -> Result<(Playbook, Run)> {
        let run = self
            .store
            .get_run(run_id)?
            .filter(|r| r.playbook_id == playbook_id)
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id} of playbook {playbook_id}")))?;
        let playbook = self
            .store
            .get_playbook(playbook_id)?
            .ok_or_else(|| EngineError::NotFound(format!("playbook {playbook_id}")))?;
        if run.status != RunStatus::Pending {
            return Err(EngineError::Conflict(format!(
                "run {run_id} is {}, not pending approval",
                run.status
            )));
        }
        Ok((playbook, run))
    }

    /// `any`: one approval. `all`: every listed person, and at least one
    /// member of every listed team.
    fn satisfied(&self, policy: &ApprovalSpec, approvals: &[Approval]) -> Result<bool> {
        if approvals.is_empty() {
            return Ok(false);
        }
        if policy.approval_type == ApprovalType::Any {
            return Ok(true);
        }

        let approvers: HashSet<Uuid> = approvals.iter().filter_map(|a| a.person_id).collect();
        let mut approving_teams: HashSet<Uuid> =
            approvals.iter().filter_map(|a| a.team_id).collect();
        for person in &approvers {
            approving_teams.extend(self.store.teams_for_person(*person)?.into_iter().map(|t| t.id));
        }

        for email in &policy.approvers.people {
            match self.store.get_person_by_email(email)? {
                Some(person) if approvers.contains(&person.id) => {}
                _ => return Ok(false),
            }
        }
        for name in &policy.approvers.teams {
            match self.store.get_team_by_name(name)? {
                Some(team) if approving_teams.contains(&team.id) => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

fn policy(playbook: &Playbook) -> Result<&ApprovalSpec> {
    playbook
        .spec
        .approval
        .as_ref()
        .filter(|a| !a.approvers.is_empty())
        .ok_or_else(|| EngineError::Conflict(format!("playbook {} has no approvers", playbook.name)))
}

/// The approval `principal` is entitled to record, or `Forbidden`.
fn eligible(policy: &ApprovalSpec, run_id: Uuid, principal: &Principal) -> Result<Approval> {
    if policy
        .approvers
        .people
        .iter()
        .any(|p| p.eq_ignore_ascii_case(principal.email()))
    {
        return Ok(Approval::by_person(run_id, principal.id()));
    }
    if let Some(team) = policy
        .approvers
        .teams
        .iter()
        .find_map(|name| principal.team(name))
    {
        return Ok(Approval::by_team(run_id, principal.id(), team.id));
    }
    Err(EngineError::Forbidden(format!(
        "{} is not an approver of this playbook",
        principal.email()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use remedy_types::{Approvers, Person, PlaybookSpec, Team};

    struct Fixture {
        store: Arc<Store>,
        gate: ApprovalGate,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        Fixture {
            gate: ApprovalGate::new(store.clone(), Notifier::new()),
            store,
        }
    }

    fn person(store: &Store, email: &str) -> Principal {
        let p = Person {
            id: Uuid::new_v4(),
            name: email.split('@').next().unwrap().into(),
            email: email.into(),
        };
        store.upsert_person(&p).unwrap();
        store.principal_for_email(email).unwrap().unwrap()
    }

    fn pending_run(store: &Store, approval_type: ApprovalType, people: &[&str], teams: &[&str]) -> Run {
        let pb = store
            .upsert_playbook(&Playbook::new(
                "guarded",
                PlaybookSpec {
                    approval: Some(ApprovalSpec {
                        approval_type,
                        approvers: Approvers {
                            people: people.iter().map(|s| s.to_string()).collect(),
                            teams: teams.iter().map(|s| s.to_string()).collect(),
                        },
                    }),
                    ..Default::default()
                },
            ))
            .unwrap();
        let mut run = Run::new(pb.id);
        run.status = RunStatus::Pending;
        store.insert_run(&run).unwrap();
        run
    }

    #[test]
    fn test_any_policy() {
        let f = fixture();
        let run = pending_run(&f.store, ApprovalType::Any, &["john@x", "jane@x"], &[]);
        let bob = person(&f.store, "bob@x");
        let jane = person(&f.store, "jane@x");

        assert!(matches!(
            f.gate.approve(run.playbook_id, run.id, &bob),
            Err(EngineError::Forbidden(_))
        ));
        assert_eq!(f.store.require_run(run.id).unwrap().status, RunStatus::Pending);

        let approved = f.gate.approve(run.playbook_id, run.id, &jane).unwrap();
        assert_eq!(approved.status, RunStatus::Scheduled);
        assert!(matches!(
            f.gate.approve(run.playbook_id, run.id, &jane),
            Err(EngineError::Conflict(_))
        ));
    }

    #[test]
    fn test_all_policy_needs_people_and_one_member_per_team() {
        let f = fixture();
        let run = pending_run(&f.store, ApprovalType::All, &["john@x"], &["sre"]);
        let john = person(&f.store, "john@x");
        let mut kim = person(&f.store, "kim@x");
        let sre = Team {
            id: Uuid::new_v4(),
            name: "sre".into(),
        };
        f.store.upsert_team(&sre).unwrap();
        f.store.add_team_member(sre.id, kim.person.id).unwrap();
        kim.teams.push(sre);

        let after_john = f.gate.approve(run.playbook_id, run.id, &john).unwrap();
        assert_eq!(after_john.status, RunStatus::Pending);
        // Repeating an approval changes nothing.
        f.gate.approve(run.playbook_id, run.id, &john).unwrap();
        assert_eq!(f.store.list_approvals(run.id).unwrap().len(), 1);

        let after_kim = f.gate.approve(run.playbook_id, run.id, &kim).unwrap();
        assert_eq!(after_kim.status, RunStatus::Scheduled);
    }

    #[test]
    fn test_final_approval_racing_another_is_not_a_conflict() {
        let f = fixture();
        let run = pending_run(&f.store, ApprovalType::Any, &["john@x", "jane@x"], &[]);
        let jane = person(&f.store, "jane@x");
        let playbook = f.store.get_playbook(run.playbook_id).unwrap().unwrap();

        f.gate.approve(run.playbook_id, run.id, &jane).unwrap();
        // John's approval passed the pending check before Jane's committed.
        let scheduled = f.gate.schedule(&playbook, run.id).unwrap();
        assert_eq!(scheduled.status, RunStatus::Scheduled);

        f.store.cancel_run(run.id).unwrap();
        assert!(matches!(
            f.gate.schedule(&playbook, run.id),
            Err(EngineError::Conflict(_))
        ));
    }

    #[test]
    fn test_reject_cancels() {
        let f = fixture();
        let run = pending_run(&f.store, ApprovalType::Any, &["jane@x"], &[]);
        let jane = person(&f.store, "jane@x");
        let rejected = f.gate.reject(run.playbook_id, run.id, &jane).unwrap();
        assert_eq!(rejected.status, RunStatus::Cancelled);
        assert_eq!(rejected.error.as_deref(), Some("rejected"));
        assert!(rejected.end_time.is_some());
    }

    #[test]
    fn test_wrong_playbook_is_not_found() {
        let f = fixture();
        let run = pending_run(&f.store, ApprovalType::Any, &["jane@x"], &[]);
        let jane = person(&f.store, "jane@x");
        assert!(matches!(
            f.gate.approve(Uuid::new_v4(), run.id, &jane),
            Err(EngineError::NotFound(_))
        ));
    }
}
