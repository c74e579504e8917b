//! Method table of the daemon.
//!
//! Short calls (schema, mutations, transactions) are answered directly.
//! `query`, `count` and `exec` go through the [`QueryEngine`]; their replies are
//! built later from the completion by [`RpcHandler::completion_response`].

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;

use super::protocol::{INTERNAL_ERROR, METHOD_NOT_FOUND, Request, Response, RpcError};
use crate::config::DaemonConfig;
use crate::services::database::engine::{AsyncQuery, QueryInput, QueryKind, QueryOutput, QueryStatus};
use crate::services::database::sql::KeyValue;
use crate::services::database::traits::{
    Column, DatabaseConnection, SensitiveString, SharedConnection, TableSchema, Transactional,
    Value as DbValue,
};
use crate::services::database::{
    ConnId, ConnectionFactory, ConnectionPool, DbError, QueryEngine,
};

type RpcResult<T> = Result<T, RpcError>;

// Payloads

#[derive(Debug, Deserialize)]
struct ConnectParams {
    connstr: String,
    #[serde(default)]
    password: Option<SensitiveString>,
}

#[derive(Debug, Deserialize)]
struct ConnParams {
    conn_id: ConnId,
}

#[derive(Debug, Deserialize)]
struct TableParams {
    conn_id: ConnId,
    table: String,
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    conn_id: ConnId,
    table: String,
    #[serde(default)]
    offset: Option<u64>,
    #[serde(default)]
    limit: Option<u64>,
    #[serde(default)]
    order_by: Option<String>,
    #[serde(default)]
    desc: bool,
}

#[derive(Debug, Deserialize)]
struct ExecParams {
    conn_id: ConnId,
    sql: String,
}

/// A column and its JSON value, decoded once the column's type is known
#[derive(Debug, Deserialize)]
struct RawKey {
    column: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct UpdateParams {
    conn_id: ConnId,
    table: String,
    column: String,
    #[serde(default)]
    value: Value,
    pk: Vec<RawKey>,
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    conn_id: ConnId,
    table: String,
    pk: Vec<RawKey>,
}

#[derive(Debug, Deserialize)]
struct InsertColumn {
    name: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct InsertParams {
    conn_id: ConnId,
    table: String,
    columns: Vec<InsertColumn>,
}

fn params<T: DeserializeOwned>(value: Value) -> RpcResult<T> {
    let value = match value {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(value).map_err(RpcError::invalid_params)
}

fn to_json<T: serde::Serialize>(value: &T) -> RpcResult<Value> {
    serde_json::to_value(value).map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))
}

fn require_pk(pk: &[RawKey]) -> RpcResult<()> {
    if pk.is_empty() {
        return Err(RpcError::invalid_params("pk must name at least one column"));
    }
    Ok(())
}

/// Decode `raw` with the declared type of `column`, so hex blobs and integers
/// sent as strings come back as what they were read as.
fn typed_value(schema: &TableSchema, column: &str, raw: &Value) -> RpcResult<DbValue> {
    let column = schema.column(column).ok_or_else(|| {
        RpcError::invalid_params(format!("no column {column} in {}", schema.name))
    })?;
    Ok(DbValue::from_json_typed(raw, column.data_type))
}

fn typed_keys(schema: &TableSchema, pk: &[RawKey]) -> RpcResult<Vec<KeyValue>> {
    pk.iter()
        .map(|key| {
            typed_value(schema, &key.column, &key.value)
                .map(|value| KeyValue::new(key.column.clone(), value))
        })
        .collect()
}

/// Dispatches requests against one pool and engine.
#[derive(Debug)]
pub struct RpcHandler {
    engine: Arc<QueryEngine>,
    config: DaemonConfig,
}

impl RpcHandler {
    pub fn new(config: DaemonConfig) -> Self {
        let pool = ConnectionPool::new(
            Arc::new(ConnectionFactory::with_builtin_drivers()),
            config.max_connections,
        )
        .with_max_result_rows(config.max_result_rows);
        Self::with_engine(Arc::new(QueryEngine::new(Arc::new(pool))), config)
    }

    pub fn with_engine(engine: Arc<QueryEngine>, config: DaemonConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &Arc<QueryEngine> {
        &self.engine
    }

    fn pool(&self) -> &ConnectionPool {
        self.engine.pool()
    }

    /// Handle one request.
    ///
    /// Returns `None` for notifications and for calls whose reply is deferred
    /// to a query completion.
    pub async fn handle(&self, request: Request) -> Option<Response> {
        let Request { id, method, params } = request;
        tracing::debug!(%method, id = ?id, "request");

        let outcome = match method.as_str() {
            "connect" => self.connect(params).await,
            "disconnect" => self.disconnect(params).await,
            "connections" => to_json(&self.pool().list()).map(Some),
            "tables" => self.tables(params).await,
            "schema" => self.schema(params).await,
            "query" => self.submit_page(params, id.clone()),
            "count" => self.submit_count(params, id.clone()),
            "exec" => self.submit_exec(params, id.clone()),
            "update" => self.update(params).await,
            "delete" => self.delete(params).await,
            "insert" => self.insert(params).await,
            "begin" => self.begin(params).await,
            "commit" => self.commit(params).await,
            "rollback" => self.rollback(params).await,
            "cancel" => self.cancel(params).await,
            "ping" => self.ping(params).await,
            other => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            )),
        };

        let id = id?;
        match outcome {
            Ok(Some(result)) => Some(Response::ok(id, result)),
            Ok(None) => None,
            Err(error) => Some(Response::err(id, error)),
        }
    }

    /// Reply for a finished engine query, `None` when it was started by a notification.
    pub fn completion_response(mut query: AsyncQuery) -> Option<Response> {
        let id = query.correlation.take()?;
        let kind = query.kind();

        let outcome = match (query.status(), query.take_output()) {
            (QueryStatus::Cancelled, _) => Err(DbError::QueryCancelled.into()),
            (_, Some(Err(err))) => Err(RpcError::from(err)),
            (_, Some(Ok(output))) => Self::render_output(kind, output),
            (status, None) => Err(RpcError::new(
                INTERNAL_ERROR,
                format!("query {} finished as {status:?} without output", query.id),
            )),
        };

        Some(match outcome {
            Ok(result) => Response::ok(id, result),
            Err(error) => Response::err(id, error),
        })
    }

    fn render_output(kind: QueryKind, output: QueryOutput) -> RpcResult<Value> {
        match (kind, output) {
            (QueryKind::RawExec, QueryOutput::Rows(rows)) => {
                Ok(json!({"type": "select", "data": to_json(&rows)?}))
            }
            (QueryKind::RawExec, QueryOutput::Affected(affected)) => {
                Ok(json!({"type": "exec", "affected": affected}))
            }
            (_, QueryOutput::Rows(rows)) => to_json(&rows),
            (_, QueryOutput::Count(count)) => to_json(&count),
            (_, QueryOutput::Affected(affected)) => Ok(json!({"affected": affected})),
        }
    }

    /// Start a query unless one is already running on the connection.
    fn submit(
        &self,
        conn_id: ConnId,
        input: QueryInput,
        id: Option<Value>,
    ) -> RpcResult<Option<Value>> {
        self.pool().require(conn_id)?;
        self.engine.try_submit(conn_id, input, id)?;
        Ok(None)
    }

    fn submit_page(&self, raw: Value, id: Option<Value>) -> RpcResult<Option<Value>> {
        let p: QueryParams = params(raw)?;
        let input = QueryInput::Page {
            table: p.table,
            offset: p.offset.unwrap_or(0),
            limit: self.config.page_size(p.limit),
            order_by: p.order_by.filter(|o| !o.trim().is_empty()),
            desc: p.desc,
        };
        self.submit(p.conn_id, input, id)
    }

    fn submit_count(&self, raw: Value, id: Option<Value>) -> RpcResult<Option<Value>> {
        let p: TableParams = params(raw)?;
        self.submit(p.conn_id, QueryInput::Count { table: p.table }, id)
    }

    fn submit_exec(&self, raw: Value, id: Option<Value>) -> RpcResult<Option<Value>> {
        let p: ExecParams = params(raw)?;
        if p.sql.trim().is_empty() {
            return Err(RpcError::invalid_params("sql is empty"));
        }
        self.submit(p.conn_id, QueryInput::Sql { sql: p.sql }, id)
    }

    async fn connect(&self, raw: Value) -> RpcResult<Option<Value>> {
        let p: ConnectParams = params(raw)?;
        let conn_id = self.pool().connect(&p.connstr, p.password).await?;
        Ok(Some(json!({ "conn_id": conn_id })))
    }

    async fn disconnect(&self, raw: Value) -> RpcResult<Option<Value>> {
        let p: ConnParams = params(raw)?;
        self.engine.queue().request_cancel(p.conn_id);
        self.pool().disconnect(p.conn_id).await?;
        Ok(Some(json!({ "disconnected": true })))
    }

    fn conn(&self, conn_id: ConnId) -> RpcResult<SharedConnection> {
        Ok(self.pool().require(conn_id)?)
    }

    async fn tables(&self, raw: Value) -> RpcResult<Option<Value>> {
        let p: ConnParams = params(raw)?;
        let tables = self.conn(p.conn_id)?.list_tables().await?;
        Ok(Some(to_json(&tables)?))
    }

    async fn schema(&self, raw: Value) -> RpcResult<Option<Value>> {
        let p: TableParams = params(raw)?;
        let schema = self.conn(p.conn_id)?.get_table_schema(&p.table).await?;
        Ok(Some(to_json(&schema)?))
    }

    async fn update(&self, raw: Value) -> RpcResult<Option<Value>> {
        let p: UpdateParams = params(raw)?;
        require_pk(&p.pk)?;
        let conn = self.conn(p.conn_id)?;
        let schema = conn.get_table_schema(&p.table).await?;
        let value = typed_value(&schema, &p.column, &p.value)?;
        let pk = typed_keys(&schema, &p.pk)?;
        let affected = conn.update_cell(&p.table, &p.column, &value, &pk).await?;
        Ok(Some(json!({ "affected": affected })))
    }

    async fn delete(&self, raw: Value) -> RpcResult<Option<Value>> {
        let p: DeleteParams = params(raw)?;
        require_pk(&p.pk)?;
        let conn = self.conn(p.conn_id)?;
        let schema = conn.get_table_schema(&p.table).await?;
        let pk = typed_keys(&schema, &p.pk)?;
        let affected = conn.delete_row(&p.table, &pk).await?;
        Ok(Some(json!({ "affected": affected })))
    }

    /// Insert using the table's own column metadata, so auto-increment columns
    /// given as null are left to the database and values decode by column type.
    async fn insert(&self, raw: Value) -> RpcResult<Option<Value>> {
        let p: InsertParams = params(raw)?;
        let conn = self.conn(p.conn_id)?;
        let schema = conn.get_table_schema(&p.table).await?;

        let mut columns: Vec<Column> = Vec::with_capacity(p.columns.len());
        let mut values: Vec<DbValue> = Vec::with_capacity(p.columns.len());
        for entry in p.columns {
            let column = schema.column(&entry.name).ok_or_else(|| {
                RpcError::invalid_params(format!("no column {} in {}", entry.name, p.table))
            })?;
            values.push(DbValue::from_json_typed(&entry.value, column.data_type));
            columns.push(column.clone());
        }

        let affected = conn.insert_row(&p.table, &columns, &values).await?;
        Ok(Some(json!({ "affected": affected })))
    }

    fn transactional(conn: &dyn DatabaseConnection) -> RpcResult<&dyn Transactional> {
        conn.as_transactional()
            .ok_or_else(|| DbError::TransactionsUnsupported.into())
    }

    async fn begin(&self, raw: Value) -> RpcResult<Option<Value>> {
        let p: ConnParams = params(raw)?;
        let conn = self.conn(p.conn_id)?;
        let depth = Self::transactional(conn.as_ref())?.begin_transaction().await?;
        Ok(Some(json!({ "depth": depth })))
    }

    async fn commit(&self, raw: Value) -> RpcResult<Option<Value>> {
        let p: ConnParams = params(raw)?;
        let conn = self.conn(p.conn_id)?;
        let depth = Self::transactional(conn.as_ref())?.commit().await?;
        Ok(Some(json!({ "depth": depth })))
    }

    async fn rollback(&self, raw: Value) -> RpcResult<Option<Value>> {
        let p: ConnParams = params(raw)?;
        let conn = self.conn(p.conn_id)?;
        let depth = Self::transactional(conn.as_ref())?.rollback().await?;
        Ok(Some(json!({ "depth": depth })))
    }

    async fn cancel(&self, raw: Value) -> RpcResult<Option<Value>> {
        let p: ConnParams = params(raw)?;
        let cancelled = self.engine.cancel(p.conn_id).await?;
        Ok(Some(json!({ "cancelled": cancelled })))
    }

    async fn ping(&self, raw: Value) -> RpcResult<Option<Value>> {
        let p: ConnParams = params(raw)?;
        let conn = self.conn(p.conn_id)?;
        let alive = conn.ping().await;
        Ok(Some(json!({
            "alive": alive,
            "status": conn.status(),
            "last_error": conn.last_error(),
        })))
    }
}
