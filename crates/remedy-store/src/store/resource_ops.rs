//! Resource catalog and identities.
//!
//! The engine only reads these tables. The write paths exist for the
//! catalog's own ingestion and for tests; status changes on components and
//! checks publish the corresponding change event in the same transaction.

use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use uuid::Uuid;

use remedy_types::{
    Canary, Check, Component, ConfigItem, Event, Person, Principal, Resource, Target, TargetKind,
    Team,
};

use super::event_ops::insert_event;
use super::{Store, col_json, col_opt_json, col_opt_uuid, col_uuid, opt_uuid};
use crate::error::Result;

impl Store {
    // ── Config items ────────────────────────────────────────────────

    /// Insert or update a config item and publish `config.created` or
    /// `config.updated`.
    pub fn upsert_config_item(&self, item: &ConfigItem) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existed = exists(&tx, "config_items", item.id)?;
        tx.execute(
            "INSERT INTO config_items (id, name, class, type, labels, config, agent_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name, class = excluded.class, type = excluded.type,
                labels = excluded.labels, config = excluded.config, agent_id = excluded.agent_id",
            params![
                item.id.to_string(),
                item.name,
                item.config_class,
                item.config_type,
                serde_json::to_string(&item.labels)?,
                serde_json::to_string(&item.config)?,
                opt_uuid(&item.agent_id),
            ],
        )?;
        let name = if existed { "config.updated" } else { "config.created" };
        insert_event(&tx, &Event::for_resource(name, item.id))?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_config_item(&self, id: Uuid) -> Result<Option<ConfigItem>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, name, class, type, labels, config, agent_id FROM config_items WHERE id = ?1",
                params![id.to_string()],
                row_to_config_item,
            )
            .optional()?)
    }

    /// Config items of one type with the given name, in any namespace.
    pub fn find_config_items(&self, config_type: &str, name: &str) -> Result<Vec<ConfigItem>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, class, type, labels, config, agent_id FROM config_items
             WHERE type = ?1 AND name = ?2",
        )?;
        let rows = stmt.query_map(params![config_type, name], row_to_config_item)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ── Components ──────────────────────────────────────────────────

    /// Insert or update a component. A status change on an existing
    /// component publishes `component.<status>`.
    pub fn upsert_component(&self, component: &Component) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let previous = status_of(&tx, "components", component.id)?;
        tx.execute(
            "INSERT INTO components (id, name, type, labels, status, agent_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name, type = excluded.type, labels = excluded.labels,
                status = excluded.status, agent_id = excluded.agent_id",
            params![
                component.id.to_string(),
                component.name,
                component.component_type,
                serde_json::to_string(&component.labels)?,
                component.status,
                opt_uuid(&component.agent_id),
            ],
        )?;
        publish_status_change(&tx, "component", component.id, previous, &component.status)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_component(&self, id: Uuid) -> Result<Option<Component>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, name, type, labels, status, agent_id FROM components WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(Component {
                        id: col_uuid(row, 0)?,
                        name: row.get(1)?,
                        component_type: row.get(2)?,
                        labels: col_json(row, 3)?,
                        status: row.get(4)?,
                        agent_id: col_opt_uuid(row, 5)?,
                    })
                },
            )
            .optional()?)
    }

    // ── Checks & canaries ───────────────────────────────────────────

    /// Insert or update a check. A status change on an existing check
    /// publishes `check.<status>` (e.g. `check.failed`).
    pub fn upsert_check(&self, check: &Check) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let previous = status_of(&tx, "checks", check.id)?;
        tx.execute(
            "INSERT INTO checks (id, name, type, labels, status, canary_id, agent_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name, type = excluded.type, labels = excluded.labels,
                status = excluded.status, canary_id = excluded.canary_id,
                agent_id = excluded.agent_id",
            params![
                check.id.to_string(),
                check.name,
                check.check_type,
                serde_json::to_string(&check.labels)?,
                check.status,
                opt_uuid(&check.canary_id),
                opt_uuid(&check.agent_id),
            ],
        )?;
        publish_status_change(&tx, "check", check.id, previous, &check.status)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_check(&self, id: Uuid) -> Result<Option<Check>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, name, type, labels, status, canary_id, agent_id FROM checks WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(Check {
                        id: col_uuid(row, 0)?,
                        name: row.get(1)?,
                        check_type: row.get(2)?,
                        labels: col_json(row, 3)?,
                        status: row.get(4)?,
                        canary_id: col_opt_uuid(row, 5)?,
                        agent_id: col_opt_uuid(row, 6)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn upsert_canary(&self, canary: &Canary) -> Result<()> {
        self.conn().execute(
            "INSERT INTO canaries (id, name, namespace, labels, agent_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name, namespace = excluded.namespace,
                labels = excluded.labels, agent_id = excluded.agent_id",
            params![
                canary.id.to_string(),
                canary.name,
                canary.namespace,
                serde_json::to_string(&canary.labels)?,
                opt_uuid(&canary.agent_id),
            ],
        )?;
        Ok(())
    }

    pub fn get_canary(&self, id: Uuid) -> Result<Option<Canary>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, name, namespace, labels, agent_id FROM canaries WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(Canary {
                        id: col_uuid(row, 0)?,
                        name: row.get(1)?,
                        namespace: row.get(2)?,
                        labels: col_json(row, 3)?,
                        agent_id: col_opt_uuid(row, 4)?,
                    })
                },
            )
            .optional()?)
    }

    /// Load a run target of any class.
    pub fn get_resource(&self, target: Target) -> Result<Option<Resource>> {
        Ok(match target.kind {
            TargetKind::Config => self.get_config_item(target.id)?.map(Resource::Config),
            TargetKind::Component => self.get_component(target.id)?.map(Resource::Component),
            TargetKind::Check => self.get_check(target.id)?.map(Resource::Check),
        })
    }

    // ── People & teams ──────────────────────────────────────────────

    pub fn upsert_person(&self, person: &Person) -> Result<()> {
        self.conn().execute(
            "INSERT INTO people (id, name, email) VALUES (?1, ?2, ?3)
             ON CONFLICT (id) DO UPDATE SET name = excluded.name, email = excluded.email",
            params![person.id.to_string(), person.name, person.email],
        )?;
        Ok(())
    }

    pub fn get_person(&self, id: Uuid) -> Result<Option<Person>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, name, email FROM people WHERE id = ?1",
                params![id.to_string()],
                row_to_person,
            )
            .optional()?)
    }

    pub fn get_person_by_email(&self, email: &str) -> Result<Option<Person>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, name, email FROM people WHERE lower(email) = lower(?1)",
                params![email],
                row_to_person,
            )
            .optional()?)
    }

    pub fn upsert_team(&self, team: &Team) -> Result<()> {
        self.conn().execute(
            "INSERT INTO teams (id, name) VALUES (?1, ?2)
             ON CONFLICT (id) DO UPDATE SET name = excluded.name",
            params![team.id.to_string(), team.name],
        )?;
        Ok(())
    }

    pub fn get_team_by_name(&self, name: &str) -> Result<Option<Team>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, name FROM teams WHERE name = ?1",
                params![name],
                row_to_team,
            )
            .optional()?)
    }

    pub fn add_team_member(&self, team_id: Uuid, person_id: Uuid) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO team_members (team_id, person_id) VALUES (?1, ?2)",
            params![team_id.to_string(), person_id.to_string()],
        )?;
        Ok(())
    }

    pub fn teams_for_person(&self, person_id: Uuid) -> Result<Vec<Team>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.id, t.name FROM teams t
             JOIN team_members m ON m.team_id = t.id
             WHERE m.person_id = ?1 ORDER BY t.name",
        )?;
        let rows = stmt.query_map(params![person_id.to_string()], row_to_team)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The person with this email together with their teams.
    pub fn principal_for_email(&self, email: &str) -> Result<Option<Principal>> {
        let Some(person) = self.get_person_by_email(email)? else {
            return Ok(None);
        };
        let teams = self.teams_for_person(person.id)?;
        Ok(Some(Principal { person, teams }))
    }
}

fn exists(conn: &Connection, table: &str, id: Uuid) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("SELECT 1 FROM {table} WHERE id = ?1"))?;
    Ok(stmt.exists(params![id.to_string()])?)
}

fn status_of(conn: &Connection, table: &str, id: Uuid) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            &format!("SELECT status FROM {table} WHERE id = ?1"),
            params![id.to_string()],
            |r| r.get(0),
        )
        .optional()?)
}

fn publish_status_change(
    conn: &Connection,
    class: &str,
    id: Uuid,
    previous: Option<String>,
    status: &str,
) -> Result<()> {
    match previous {
        Some(prev) if prev != status && !status.is_empty() => {
            insert_event(conn, &Event::for_resource(format!("{class}.{status}"), id))
        }
        _ => Ok(()),
    }
}

fn row_to_person(row: &Row<'_>) -> rusqlite::Result<Person> {
    Ok(Person {
        id: col_uuid(row, 0)?,
        name: row.get(1)?,
        email: row.get(2)?,
    })
}

fn row_to_team(row: &Row<'_>) -> rusqlite::Result<Team> {
    Ok(Team {
        id: col_uuid(row, 0)?,
        name: row.get(1)?,
    })
}

fn row_to_config_item(row: &Row<'_>) -> rusqlite::Result<ConfigItem> {
    Ok(ConfigItem {
        id: col_uuid(row, 0)?,
        name: row.get(1)?,
        config_class: row.get(2)?,
        config_type: row.get(3)?,
        labels: col_json(row, 4)?,
        config: col_opt_json(row, 5)?.unwrap_or_default(),
        agent_id: col_opt_uuid(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_item_events() {
        let store = Store::open_in_memory().unwrap();
        let item = ConfigItem {
            id: Uuid::new_v4(),
            name: "cluster".into(),
            config_class: "EKSCluster".into(),
            ..Default::default()
        };
        store.upsert_config_item(&item).unwrap();
        store.upsert_config_item(&item).unwrap();

        let events = store.claim_events(10, 5).unwrap();
        let names: Vec<_> = events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["config.created", "config.updated"]);
        assert_eq!(events[0].resource_id(), Some(item.id));

        let got = store.get_config_item(item.id).unwrap().unwrap();
        assert_eq!(got.config_class, "EKSCluster");
    }

    #[test]
    fn test_find_config_items_by_type_and_name() {
        let store = Store::open_in_memory().unwrap();
        for config_type in ["Kubernetes::Kustomization", "Kubernetes::Deployment"] {
            store
                .upsert_config_item(&ConfigItem {
                    id: Uuid::new_v4(),
                    name: "apps".into(),
                    config_type: config_type.into(),
                    ..Default::default()
                })
                .unwrap();
        }

        let found = store.find_config_items("Kubernetes::Kustomization", "apps").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].config_type, "Kubernetes::Kustomization");
        assert!(store.find_config_items("Kubernetes::Kustomization", "infra").unwrap().is_empty());
    }

    #[test]
    fn test_component_status_change_publishes() {
        let store = Store::open_in_memory().unwrap();
        let mut c = Component {
            id: Uuid::new_v4(),
            name: "logistics".into(),
            component_type: "Entity".into(),
            status: "healthy".into(),
            ..Default::default()
        };
        store.upsert_component(&c).unwrap();
        assert_eq!(store.count_events().unwrap(), 0);

        store.upsert_component(&c).unwrap();
        assert_eq!(store.count_events().unwrap(), 0);

        c.status = "unhealthy".into();
        store.upsert_component(&c).unwrap();
        let events = store.claim_events(10, 5).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "component.unhealthy");

        let r = store.get_resource(Target::component(c.id)).unwrap().unwrap();
        assert_eq!(r.resource_type(), "Entity");
    }

    #[test]
    fn test_check_status_change_publishes() {
        let store = Store::open_in_memory().unwrap();
        let mut check = Check {
            id: Uuid::new_v4(),
            name: "http".into(),
            status: "passed".into(),
            ..Default::default()
        };
        store.upsert_check(&check).unwrap();
        check.status = "failed".into();
        store.upsert_check(&check).unwrap();
        let events = store.claim_events(10, 5).unwrap();
        assert_eq!(events[0].name, "check.failed");
    }

    #[test]
    fn test_principal_with_teams() {
        let store = Store::open_in_memory().unwrap();
        let jane = Person {
            id: Uuid::new_v4(),
            name: "Jane".into(),
            email: "jane@x".into(),
        };
        let ops = Team {
            id: Uuid::new_v4(),
            name: "ops".into(),
        };
        store.upsert_person(&jane).unwrap();
        store.upsert_team(&ops).unwrap();
        store.add_team_member(ops.id, jane.id).unwrap();
        store.add_team_member(ops.id, jane.id).unwrap();

        let p = store.principal_for_email("JANE@x").unwrap().unwrap();
        assert_eq!(p.id(), jane.id);
        assert!(p.team("ops").is_some());
        assert!(store.principal_for_email("bob@x").unwrap().is_none());
    }
}
