//! `sql`: a parameterised statement against a named sqlite connection.

use std::path::PathBuf;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, params_from_iter};
use serde_json::{Map, Value, json};

use remedy_config::ConnectionType;
use remedy_types::SqlAction;

use super::{ActionContext, ActionOutput};
use crate::error::{EngineError, Result};

/// Rows returned before the result set is cut off.
const MAX_ROWS: usize = 1000;

pub(super) async fn run(ctx: &ActionContext, spec: &SqlAction) -> Result<ActionOutput> {
    let conn = ctx.config.connection(&spec.connection)?;
    if conn.kind != ConnectionType::Sqlite {
        return Err(EngineError::Validation(format!(
            "connection '{}' is not a sqlite connection",
            spec.connection
        )));
    }
    let path = sqlite_path(conn.require_url(&spec.connection)?);
    let query = spec.query.clone();
    let args = spec.args.clone();

    tokio::task::spawn_blocking(move || query_sqlite(&path, &query, &args))
        .await
        .map_err(|e| EngineError::Internal(format!("sql task failed: {e}")))?
        .map(ActionOutput::ok)
}

/// `sqlite:///abs/path`, `sqlite://rel/path`, `file:...` or a bare path.
fn sqlite_path(url: &str) -> PathBuf {
    let stripped = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .or_else(|| url.strip_prefix("file://"))
        .or_else(|| url.strip_prefix("file:"))
        .unwrap_or(url);
    PathBuf::from(stripped)
}

fn query_sqlite(path: &PathBuf, query: &str, args: &[String]) -> Result<Value> {
    let db = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI,
    )
    .map_err(|e| EngineError::ActionFailed(format!("opening {}: {e}", path.display())))?;

    let sql_err = |e: rusqlite::Error| EngineError::ActionFailed(format!("sql: {e}"));
    let mut stmt = db.prepare(query).map_err(sql_err)?;

    if stmt.column_count() == 0 {
        let affected = stmt.execute(params_from_iter(args.iter())).map_err(sql_err)?;
        return Ok(json!({ "rowsAffected": affected }));
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(args.iter())).map_err(sql_err)?;
    let mut out = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next().map_err(sql_err)? {
        if out.len() == MAX_ROWS {
            truncated = true;
            break;
        }
        let mut obj = Map::new();
        for (i, name) in columns.iter().enumerate() {
            obj.insert(name.clone(), to_json(row.get_ref(i).map_err(sql_err)?));
        }
        out.push(Value::Object(obj));
    }

    Ok(json!({
        "columns": columns,
        "count": out.len(),
        "rows": out,
        "truncated": truncated,
    }))
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::context_with;
    use super::*;
    use remedy_config::{ConnectionConfig, RemedyConfig};
    use tempfile::TempDir;

    fn setup() -> (TempDir, super::super::ActionContext) {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("inventory.db");
        let conn = Connection::open(&db).unwrap();
        conn.execute_batch(
            "CREATE TABLE hosts (name TEXT, cpu INTEGER);
             INSERT INTO hosts VALUES ('a', 2), ('b', 8);",
        )
        .unwrap();

        let mut config = RemedyConfig::default();
        config.connections.insert(
            "inventory".into(),
            ConnectionConfig::new(ConnectionType::Sqlite)
                .with_url(format!("sqlite://{}", db.display())),
        );
        (dir, context_with(config, None))
    }

    #[tokio::test]
    async fn test_select_with_args() {
        let (_dir, ctx) = setup();
        let spec = SqlAction {
            connection: "inventory".into(),
            query: "SELECT name, cpu FROM hosts WHERE cpu > ?1 ORDER BY name".into(),
            args: vec!["4".into()],
        };
        let out = run(&ctx, &spec).await.unwrap();
        assert_eq!(out.result["count"], 1);
        assert_eq!(out.result["rows"][0]["name"], "b");
        assert_eq!(out.result["rows"][0]["cpu"], 8);
        assert_eq!(out.result["columns"], json!(["name", "cpu"]));
    }

    #[tokio::test]
    async fn test_update_reports_affected_rows() {
        let (_dir, ctx) = setup();
        let spec = SqlAction {
            connection: "inventory".into(),
            query: "UPDATE hosts SET cpu = cpu * 2".into(),
            args: vec![],
        };
        let out = run(&ctx, &spec).await.unwrap();
        assert_eq!(out.result["rowsAffected"], 2);
    }

    #[tokio::test]
    async fn test_sql_error_fails_action() {
        let (_dir, ctx) = setup();
        let spec = SqlAction {
            connection: "inventory".into(),
            query: "SELECT * FROM nope".into(),
            args: vec![],
        };
        assert!(matches!(
            run(&ctx, &spec).await,
            Err(EngineError::ActionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let (_dir, ctx) = setup();
        let spec = SqlAction {
            connection: "missing".into(),
            query: "SELECT 1".into(),
            args: vec![],
        };
        assert!(matches!(run(&ctx, &spec).await, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_sqlite_path_forms() {
        assert_eq!(sqlite_path("sqlite:///var/db.sqlite"), PathBuf::from("/var/db.sqlite"));
        assert_eq!(sqlite_path("/plain.db"), PathBuf::from("/plain.db"));
    }
}
