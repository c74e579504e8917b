//! JSON-RPC method table and stdio loop against SQLite.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use dbmux::config::DaemonConfig;
use dbmux::rpc::{Request, Response, RpcHandler, serve};

fn handler() -> RpcHandler {
    RpcHandler::new(DaemonConfig::default())
}

fn request(id: i64, method: &str, params: Value) -> Request {
    Request::from_value(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
        .expect("well-formed request")
}

/// Send a call and return its reply, waiting for the engine when the reply is deferred.
async fn call(handler: &RpcHandler, id: i64, method: &str, params: Value) -> Response {
    if let Some(response) = handler.handle(request(id, method, params)).await {
        return response;
    }
    let done = handler
        .engine()
        .queue()
        .wait(Duration::from_secs(30))
        .await
        .expect("deferred call did not complete");
    RpcHandler::completion_response(done).expect("call carried an id")
}

async fn ok(handler: &RpcHandler, id: i64, method: &str, params: Value) -> Value {
    let response = call(handler, id, method, params).await;
    assert_eq!(response.id, json!(id));
    match response.result {
        Some(result) => result,
        None => panic!("{method} failed: {:?}", response.error),
    }
}

async fn error_code(handler: &RpcHandler, id: i64, method: &str, params: Value) -> i32 {
    let response = call(handler, id, method, params).await;
    assert!(response.result.is_none(), "{method} unexpectedly succeeded");
    response.error.map(|e| e.code).unwrap_or_default()
}

async fn connect_memory(handler: &RpcHandler) -> u64 {
    let result = ok(handler, 0, "connect", json!({"connstr": "sqlite::memory:"})).await;
    result["conn_id"].as_u64().unwrap()
}

#[test]
fn test_users_walkthrough() {
    smol::block_on(async {
        let handler = handler();
        let conn = connect_memory(&handler).await;
        assert_eq!(conn, 1);

        ok(&handler, 1, "exec", json!({"conn_id": conn, "sql": "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)"})).await;
        for (i, name) in ["Ann", "Ben", "Cy"].into_iter().enumerate() {
            let result = ok(
                &handler,
                2,
                "insert",
                json!({"conn_id": conn, "table": "users", "columns": [
                    {"name": "id", "value": i as i64 + 1},
                    {"name": "name", "value": name},
                ]}),
            )
            .await;
            assert_eq!(result["affected"], 1);
        }

        let tables = ok(&handler, 3, "tables", json!({"conn_id": conn})).await;
        assert_eq!(tables, json!(["users"]));

        let schema = ok(&handler, 4, "schema", json!({"conn_id": conn, "table": "users"})).await;
        assert_eq!(schema["columns"][0]["name"], "id");
        assert_eq!(schema["columns"][0]["primary_key"], true);

        let page = ok(
            &handler,
            5,
            "query",
            json!({"conn_id": conn, "table": "users", "limit": 2, "order_by": "id"}),
        )
        .await;
        assert_eq!(page["num_rows"], 2);
        assert_eq!(page["total_rows"], 3);
        assert_eq!(page["rows"][0], json!([1, "Ann"]));

        let updated = ok(
            &handler,
            6,
            "update",
            json!({"conn_id": conn, "table": "users", "column": "name", "value": "Bob",
                   "pk": [{"column": "id", "value": 1}]}),
        )
        .await;
        assert_eq!(updated["affected"], 1);

        let page = ok(&handler, 7, "query", json!({"conn_id": conn, "table": "users", "order_by": "id"})).await;
        assert_eq!(page["rows"][0], json!([1, "Bob"]));

        let deleted = ok(
            &handler,
            8,
            "delete",
            json!({"conn_id": conn, "table": "users", "pk": [{"column": "id", "value": 1}]}),
        )
        .await;
        assert_eq!(deleted["affected"], 1);

        let count = ok(&handler, 9, "count", json!({"conn_id": conn, "table": "users"})).await;
        assert_eq!(count, json!({"count": 2, "approximate": false}));

        let connections = ok(&handler, 10, "connections", Value::Null).await;
        assert_eq!(connections[0]["id"], conn);

        let ping = ok(&handler, 11, "ping", json!({"conn_id": conn})).await;
        assert_eq!(ping["alive"], true);
        assert_eq!(ping["status"], "connected");

        ok(&handler, 12, "disconnect", json!({"conn_id": conn})).await;
        assert_eq!(error_code(&handler, 13, "tables", json!({"conn_id": conn})).await, -32003);
    });
}

#[test]
fn test_exec_reply_shapes() {
    smol::block_on(async {
        let handler = handler();
        let conn = connect_memory(&handler).await;

        let created = ok(&handler, 1, "exec", json!({"conn_id": conn, "sql": "CREATE TABLE t (x INTEGER)"})).await;
        assert_eq!(created, json!({"type": "exec", "affected": 0}));

        let inserted = ok(&handler, 2, "exec", json!({"conn_id": conn, "sql": "INSERT INTO t VALUES (1), (2)"})).await;
        assert_eq!(inserted, json!({"type": "exec", "affected": 2}));

        let selected = ok(
            &handler,
            3,
            "exec",
            json!({"conn_id": conn, "sql": "WITH s AS (SELECT sum(x) AS total FROM t) SELECT total FROM s"}),
        )
        .await;
        assert_eq!(selected["type"], "select");
        assert_eq!(selected["data"]["rows"], json!([[3]]));

        assert_eq!(
            error_code(&handler, 4, "exec", json!({"conn_id": conn, "sql": "SELEC nonsense"})).await / 10,
            -3201
        );
        assert_eq!(error_code(&handler, 5, "exec", json!({"conn_id": conn, "sql": "  "})).await, -32602);
    });
}

#[test]
fn test_blobs_and_large_ids_survive_a_round_trip() {
    smol::block_on(async {
        let handler = handler();
        let conn = connect_memory(&handler).await;
        ok(&handler, 1, "exec", json!({"conn_id": conn, "sql": "CREATE TABLE files (id INTEGER PRIMARY KEY, data BLOB)"})).await;

        let big = "9007199254740993";
        ok(
            &handler,
            2,
            "insert",
            json!({"conn_id": conn, "table": "files", "columns": [
                {"name": "id", "value": big},
                {"name": "data", "value": "00ff10"},
            ]}),
        )
        .await;

        let page = ok(&handler, 3, "query", json!({"conn_id": conn, "table": "files"})).await;
        assert_eq!(page["rows"], json!([[big, "00ff10"]]));

        let stored = ok(
            &handler,
            4,
            "exec",
            json!({"conn_id": conn, "sql": "SELECT typeof(data), id - 9007199254740992 FROM files"}),
        )
        .await;
        assert_eq!(stored["data"]["rows"], json!([["blob", 1]]));

        let updated = ok(
            &handler,
            5,
            "update",
            json!({"conn_id": conn, "table": "files", "column": "data", "value": "abcd",
                   "pk": [{"column": "id", "value": big}]}),
        )
        .await;
        assert_eq!(updated["affected"], 1);
        let stored = ok(&handler, 6, "exec", json!({"conn_id": conn, "sql": "SELECT typeof(data), hex(data) FROM files"})).await;
        assert_eq!(stored["data"]["rows"], json!([["blob", "ABCD"]]));

        // an integral float key still matches the integer row
        ok(
            &handler,
            7,
            "insert",
            json!({"conn_id": conn, "table": "files", "columns": [{"name": "id", "value": 2.0}]}),
        )
        .await;
        let deleted = ok(
            &handler,
            8,
            "delete",
            json!({"conn_id": conn, "table": "files", "pk": [{"column": "id", "value": 2.0}]}),
        )
        .await;
        assert_eq!(deleted["affected"], 1);

        assert_eq!(
            error_code(
                &handler,
                9,
                "update",
                json!({"conn_id": conn, "table": "files", "column": "nope", "value": 1,
                       "pk": [{"column": "id", "value": big}]}),
            )
            .await,
            -32602
        );
    });
}

#[test]
fn test_nested_transactions() {
    smol::block_on(async {
        let handler = handler();
        let conn = connect_memory(&handler).await;
        ok(&handler, 1, "exec", json!({"conn_id": conn, "sql": "CREATE TABLE t (x INTEGER)"})).await;

        assert_eq!(ok(&handler, 2, "begin", json!({"conn_id": conn})).await["depth"], 1);
        ok(&handler, 3, "exec", json!({"conn_id": conn, "sql": "INSERT INTO t VALUES (1)"})).await;
        assert_eq!(ok(&handler, 4, "begin", json!({"conn_id": conn})).await["depth"], 2);
        ok(&handler, 5, "exec", json!({"conn_id": conn, "sql": "INSERT INTO t VALUES (2)"})).await;
        assert_eq!(ok(&handler, 6, "rollback", json!({"conn_id": conn})).await["depth"], 1);
        assert_eq!(ok(&handler, 7, "commit", json!({"conn_id": conn})).await["depth"], 0);

        let count = ok(&handler, 8, "count", json!({"conn_id": conn, "table": "t"})).await;
        assert_eq!(count["count"], 1);

        assert_eq!(error_code(&handler, 9, "commit", json!({"conn_id": conn})).await, -32030);
    });
}

#[test]
fn test_invalid_calls() {
    smol::block_on(async {
        let handler = handler();
        assert_eq!(error_code(&handler, 1, "frobnicate", Value::Null).await, -32601);
        assert_eq!(error_code(&handler, 2, "tables", json!({"conn_id": 99})).await, -32003);
        assert_eq!(error_code(&handler, 3, "query", json!({"conn_id": 99, "table": "t"})).await, -32003);
        assert_eq!(error_code(&handler, 4, "tables", json!({"conn": 1})).await, -32602);
        assert_eq!(error_code(&handler, 5, "connect", json!({"connstr": "oracle://db"})).await / 10, -3200);

        let conn = connect_memory(&handler).await;
        assert_eq!(
            error_code(&handler, 6, "delete", json!({"conn_id": conn, "table": "t", "pk": []})).await,
            -32602
        );

        let notification = Request::from_value(json!({"jsonrpc": "2.0", "method": "ping", "params": {"conn_id": conn}}))
            .unwrap();
        assert!(notification.is_notification());
        assert!(handler.handle(notification).await.is_none());
    });
}

#[test]
fn test_serve_loop() {
    smol::block_on(async {
        let input = [
            r#"{"jsonrpc":"2.0","id":1,"method":"connect","params":{"connstr":"sqlite::memory:"}}"#,
            "this is not json",
            r#"{"jsonrpc":"2.0","id":2,"method":"nope"}"#,
            r#"{"jsonrpc":"2.0","method":"ping","params":{"conn_id":1}}"#,
            r#"{"jsonrpc":"1.0","id":3,"method":"ping"}"#,
            r#"{"jsonrpc":"2.0","id":4,"method":"exec","params":{"conn_id":7,"sql":"SELECT 1"}}"#,
            "",
        ]
        .join("\n");

        let mut output = Vec::new();
        serve(
            Arc::new(handler()),
            futures::io::Cursor::new(input.into_bytes()),
            &mut output,
        )
        .await
        .unwrap();

        let replies: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(replies.len(), 5, "{replies:?}");

        let by_id = |id: Value| {
            replies
                .iter()
                .find(|r| r["id"] == id)
                .unwrap_or_else(|| panic!("no reply for {id}"))
        };
        assert_eq!(by_id(json!(1))["result"]["conn_id"], 1);
        assert_eq!(by_id(Value::Null)["error"]["code"], -32700);
        assert_eq!(by_id(json!(2))["error"]["code"], -32601);
        assert_eq!(by_id(json!(3))["error"]["code"], -32600);
        assert_eq!(by_id(json!(4))["error"]["code"], -32003);
        assert!(replies.iter().all(|r| r["jsonrpc"] == "2.0"));
    });
}
