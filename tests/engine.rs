//! Pool and query engine against real SQLite sessions.

use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;

use dbmux::services::database::drivers::ConnectionFactory;
use dbmux::services::database::engine::{QueryEngine, QueryInput, QueryOutput, QueryStatus};
use dbmux::services::database::error::{DbError, DbResult};
use dbmux::services::database::pool::ConnectionPool;
use dbmux::services::database::sql::KeyValue;
use dbmux::services::database::traits::{
    BoxedConnection, Column, ConnectionState, DatabaseConnection, DatabaseType, ResultSet,
    TableSchema, Value,
};

const WAIT: Duration = Duration::from_secs(30);

fn engine() -> QueryEngine {
    QueryEngine::new(Arc::new(ConnectionPool::default()))
}

async fn run(engine: &QueryEngine, conn_id: u32, input: QueryInput) -> DbResult<QueryOutput> {
    engine.submit(conn_id, input, None);
    let mut done = engine
        .queue()
        .wait(WAIT)
        .await
        .expect("query did not complete in time");
    match done.status() {
        QueryStatus::Cancelled => Err(DbError::QueryCancelled),
        _ => done.take_output().expect("completed query carries output"),
    }
}

async fn exec(engine: &QueryEngine, conn_id: u32, sql: &str) {
    run(engine, conn_id, QueryInput::Sql { sql: sql.into() })
        .await
        .unwrap_or_else(|e| panic!("{sql}: {e}"));
}

fn page(table: &str, offset: u64, limit: u64) -> QueryInput {
    QueryInput::Page {
        table: table.into(),
        offset,
        limit,
        order_by: Some("id".into()),
        desc: false,
    }
}

fn ids(rows: &ResultSet) -> Vec<i64> {
    rows.rows
        .iter()
        .filter_map(|row| row.get(0).and_then(Value::as_i64))
        .collect()
}

#[test]
fn test_users_scenario() {
    smol::block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let engine = engine();
        let conn_id = engine
            .pool()
            .connect(&format!("sqlite://{}", path.display()), None)
            .await
            .unwrap();

        exec(&engine, conn_id, "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)").await;
        exec(
            &engine,
            conn_id,
            "INSERT INTO users (id, name) VALUES (1, 'Ann'), (2, 'Ben'), (3, 'Cy')",
        )
        .await;

        let Ok(QueryOutput::Rows(rows)) = run(&engine, conn_id, page("users", 0, 2)).await else {
            panic!("expected rows");
        };
        assert_eq!(rows.num_rows(), 2);
        assert_eq!(rows.total_rows, 3);

        let conn = engine.pool().require(conn_id).unwrap();
        let affected = conn
            .update_cell("users", "name", &Value::text("Bob"), &[KeyValue::new("id", 1i64)])
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let Ok(QueryOutput::Rows(rows)) = run(
            &engine,
            conn_id,
            QueryInput::Sql {
                sql: "SELECT name FROM users WHERE id = 1".into(),
            },
        )
        .await
        else {
            panic!("expected rows");
        };
        assert_eq!(rows.scalar(), Some(&Value::text("Bob")));

        conn.delete_row("users", &[KeyValue::new("id", 1i64)]).await.unwrap();
        let Ok(QueryOutput::Count(count)) = run(
            &engine,
            conn_id,
            QueryInput::Count {
                table: "users".into(),
            },
        )
        .await
        else {
            panic!("expected a count");
        };
        assert_eq!(count.count, 2);
        assert!(!count.approximate);

        engine.pool().disconnect(conn_id).await.unwrap();
        assert_eq!(engine.pool().active_count(), 0);
    });
}

#[test]
fn test_pages_are_disjoint() {
    smol::block_on(async {
        let engine = engine();
        let conn_id = engine.pool().connect("sqlite::memory:", None).await.unwrap();
        exec(&engine, conn_id, "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)").await;
        exec(
            &engine,
            conn_id,
            "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 10) \
             INSERT INTO items (id, label) SELECT x, 'item ' || x FROM n",
        )
        .await;

        let Ok(QueryOutput::Rows(first)) = run(&engine, conn_id, page("items", 0, 4)).await else {
            panic!("expected rows");
        };
        let Ok(QueryOutput::Rows(second)) = run(&engine, conn_id, page("items", 4, 4)).await else {
            panic!("expected rows");
        };
        assert_eq!(ids(&first), vec![1, 2, 3, 4]);
        assert_eq!(ids(&second), vec![5, 6, 7, 8]);
        assert_eq!(first.total_rows, 10);
        assert_eq!(second.total_rows, 10);

        let Ok(QueryOutput::Rows(last)) = run(&engine, conn_id, page("items", 8, 4)).await else {
            panic!("expected rows");
        };
        assert_eq!(ids(&last), vec![9, 10]);
    });
}

#[test]
fn test_empty_page_keeps_columns() {
    smol::block_on(async {
        let engine = engine();
        let conn_id = engine.pool().connect("sqlite::memory:", None).await.unwrap();
        exec(&engine, conn_id, "CREATE TABLE empty (id INTEGER PRIMARY KEY, note TEXT)").await;

        let Ok(QueryOutput::Rows(rows)) = run(&engine, conn_id, page("empty", 0, 10)).await else {
            panic!("expected rows");
        };
        assert_eq!(rows.num_rows(), 0);
        assert_eq!(rows.total_rows, 0);
        let names: Vec<_> = rows.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "note"]);
    });
}

#[test]
fn test_insert_with_only_generated_columns() {
    smol::block_on(async {
        let engine = engine();
        let conn_id = engine.pool().connect("sqlite::memory:", None).await.unwrap();
        exec(&engine, conn_id, "CREATE TABLE seq (id INTEGER PRIMARY KEY AUTOINCREMENT)").await;

        let conn = engine.pool().require(conn_id).unwrap();
        let schema = conn.get_table_schema("seq").await.unwrap();
        assert!(schema.columns[0].auto_increment);

        let values = vec![Value::Null(schema.columns[0].data_type); schema.columns.len()];
        assert_eq!(conn.insert_row("seq", &schema.columns, &values).await.unwrap(), 1);
        assert_eq!(conn.insert_row("seq", &schema.columns, &values).await.unwrap(), 1);

        let rows = conn.query("SELECT id FROM seq ORDER BY id").await.unwrap();
        assert_eq!(ids(&rows), vec![1, 2]);
    });
}

#[test]
fn test_cancel_wins_over_running_query() {
    smol::block_on(async {
        let engine = engine();
        let conn_id = engine.pool().connect("sqlite::memory:", None).await.unwrap();

        let id = engine.submit(
            conn_id,
            QueryInput::Sql {
                sql: "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 3000000) \
                      SELECT count(*) FROM n"
                    .into(),
            },
            None,
        );
        assert!(engine.cancel(conn_id).await.unwrap());

        let done = engine.queue().wait(WAIT).await.unwrap();
        assert_eq!(done.id, id);
        assert_eq!(done.status(), QueryStatus::Cancelled);
        assert!(done.output().is_none());

        // the session is usable again and nothing is left armed
        assert!(!engine.pool().is_query_active(conn_id));
        assert!(!engine.cancel(conn_id).await.unwrap());
        let conn = engine.pool().require(conn_id).unwrap();
        assert!(conn.query("SELECT 1").await.is_ok());
    });
}

#[test]
fn test_cancel_without_query_and_unknown_connection() {
    smol::block_on(async {
        let engine = engine();
        let conn_id = engine.pool().connect("sqlite::memory:", None).await.unwrap();
        assert!(!engine.cancel(conn_id).await.unwrap());
        assert!(matches!(
            engine.cancel(conn_id + 100).await,
            Err(DbError::InvalidConnection(_))
        ));
    });
}

#[test]
fn test_busy_connection_refuses_second_query() {
    smol::block_on(async {
        let engine = engine();
        let conn_id = engine.pool().connect("sqlite::memory:", None).await.unwrap();
        let slow = QueryInput::Sql {
            sql: "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 50000000) \
                  SELECT count(*) FROM n"
                .into(),
        };

        let id = engine.try_submit(conn_id, slow.clone(), None).unwrap();
        assert!(engine.is_busy(conn_id));
        assert!(matches!(
            engine.try_submit(conn_id, slow, None),
            Err(DbError::QueryFailed(_))
        ));

        assert!(engine.cancel(conn_id).await.unwrap());
        let done = engine.queue().wait(WAIT).await.unwrap();
        assert_eq!(done.id, id);
        assert_eq!(done.status(), QueryStatus::Cancelled);
        assert!(!engine.is_busy(conn_id));
        assert!(engine.queue().pop().is_none());
    });
}

/// A driver whose queries panic.
struct PanickingConnection {
    state: ConnectionState,
}

#[async_trait]
impl DatabaseConnection for PanickingConnection {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn state(&self) -> &ConnectionState {
        &self.state
    }

    async fn disconnect(&self) -> DbResult<()> {
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }

    async fn list_tables(&self) -> DbResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get_table_schema(&self, table: &str) -> DbResult<TableSchema> {
        Ok(TableSchema::new(table, None))
    }

    async fn query(&self, _sql: &str) -> DbResult<ResultSet> {
        panic!("decoder bug");
    }

    async fn exec(&self, _sql: &str) -> DbResult<u64> {
        Ok(0)
    }

    async fn update_cell(&self, _: &str, _: &str, _: &Value, _: &[KeyValue]) -> DbResult<u64> {
        Ok(0)
    }

    async fn insert_row(&self, _: &str, _: &[Column], _: &[Value]) -> DbResult<u64> {
        Ok(0)
    }

    async fn delete_row(&self, _: &str, _: &[KeyValue]) -> DbResult<u64> {
        Ok(0)
    }
}

#[test]
fn test_worker_panic_becomes_error_completion() {
    smol::block_on(async {
        let mut factory = ConnectionFactory::new();
        factory.register("sqlite", |config| {
            async move {
                let conn: BoxedConnection = Box::new(PanickingConnection {
                    state: ConnectionState::new(config),
                });
                Ok(conn)
            }
            .boxed()
        });
        let pool = Arc::new(ConnectionPool::new(Arc::new(factory), 4));
        let engine = QueryEngine::new(pool);
        let conn_id = engine.pool().connect("sqlite::memory:", None).await.unwrap();

        let result = run(&engine, conn_id, QueryInput::Sql { sql: "SELECT 1".into() }).await;
        match result {
            Err(DbError::Internal(message)) => assert!(message.contains("decoder bug")),
            other => panic!("unexpected outcome: {other:?}"),
        }

        // the cancel handle was released despite the panic
        assert!(!engine.pool().is_query_active(conn_id));
        assert!(matches!(
            run(&engine, conn_id, QueryInput::Sql { sql: "DELETE FROM t".into() }).await,
            Ok(QueryOutput::Affected(0))
        ));
    });
}
