//! SQL text builders shared by the drivers.
//!
//! Identifiers are always quoted here; values are never interpolated and travel
//! as bound parameters in a [`Statement`].

use serde::Deserialize;

use super::error::{DbError, DbResult};
use super::traits::row::{Column, Value};

/// Identifier quoting convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteStyle {
    /// `"name"` (SQLite, Postgres)
    DoubleQuote,
    /// `` `name` `` (MySQL, MariaDB)
    Backtick,
}

impl QuoteStyle {
    fn quote_char(self) -> char {
        match self {
            QuoteStyle::DoubleQuote => '"',
            QuoteStyle::Backtick => '`',
        }
    }
}

/// Per-backend SQL conventions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
}

impl Dialect {
    pub fn quote_style(self) -> QuoteStyle {
        match self {
            Dialect::Sqlite | Dialect::Postgres => QuoteStyle::DoubleQuote,
            Dialect::MySql => QuoteStyle::Backtick,
        }
    }

    /// Positional parameter marker, `index` is 1-based
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite | Dialect::MySql => "?".to_string(),
        }
    }

    /// Quote a possibly schema-qualified identifier
    pub fn escape(self, name: &str) -> String {
        escape_identifier(name, self.quote_style())
    }

    fn insert_defaults(self, table: &str) -> String {
        match self {
            Dialect::MySql => format!("INSERT INTO {table} () VALUES ()"),
            Dialect::Sqlite | Dialect::Postgres => format!("INSERT INTO {table} DEFAULT VALUES"),
        }
    }
}

/// Renders the placeholder for the `index`-th (1-based) parameter bound to `column`.
pub type Placeholder<'a> = &'a (dyn Fn(usize, &str) -> String + Sync);

/// A primary-key column and the value identifying the row
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KeyValue {
    pub column: String,
    pub value: Value,
}

impl KeyValue {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// SQL text plus its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Quote a single identifier, doubling any embedded quote characters
pub fn quote_identifier(name: &str, style: QuoteStyle) -> String {
    let q = style.quote_char();
    let mut out = String::with_capacity(name.len() + 2);
    out.push(q);
    for c in name.chars() {
        if c == q {
            out.push(q);
        }
        out.push(c);
    }
    out.push(q);
    out
}

/// Quote an identifier, splitting at the first `.` into `schema.table`
pub fn escape_identifier(name: &str, style: QuoteStyle) -> String {
    match name.split_once('.') {
        Some((schema, table)) => format!(
            "{}.{}",
            quote_identifier(schema, style),
            quote_identifier(table, style)
        ),
        None => quote_identifier(name, style),
    }
}

fn leading_keyword(sql: &str) -> String {
    sql.trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Whether a statement produces rows rather than an affected-row count.
///
/// Looks at the first keyword after leading whitespace. A `WITH` statement is
/// judged by the statement that follows its common table expressions, so
/// `WITH ... INSERT` is an exec and `WITH ... SELECT` a query.
pub fn is_query_statement(sql: &str) -> bool {
    match leading_keyword(sql).as_str() {
        "SELECT" | "PRAGMA" | "SHOW" | "DESCRIBE" | "EXPLAIN" => true,
        "WITH" => matches!(
            main_statement_keyword(sql).as_deref(),
            Some("SELECT" | "VALUES") | None
        ),
        _ => false,
    }
}

/// First statement keyword at nesting depth zero, skipping quoted text and
/// everything inside parentheses.
fn main_statement_keyword(sql: &str) -> Option<String> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut word = String::new();

    for c in sql.chars().chain(std::iter::once(' ')) {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        if depth == 0 && (c.is_ascii_alphanumeric() || c == '_') {
            word.push(c.to_ascii_uppercase());
            continue;
        }
        if matches!(
            word.as_str(),
            "SELECT" | "VALUES" | "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "MERGE"
        ) {
            return Some(word);
        }
        word.clear();
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    None
}

/// An `order_by` that is a clause (list or carries a direction) rather than a column name.
///
/// `ASC`/`DESC` count only as whole words, so a column such as `descr` or
/// `id_desc` is still quoted as a name.
fn is_order_clause(order_by: &str) -> bool {
    order_by.contains(',')
        || order_by
            .split_whitespace()
            .any(|word| word.eq_ignore_ascii_case("asc") || word.eq_ignore_ascii_case("desc"))
}

/// `SELECT *` over one page of a table.
///
/// A plain column name in `order_by` is quoted; a clause is used verbatim and
/// `desc` is then ignored.
pub fn build_page_query(
    dialect: Dialect,
    table: &str,
    offset: u64,
    limit: u64,
    order_by: Option<&str>,
    desc: bool,
) -> String {
    let mut sql = format!("SELECT * FROM {}", dialect.escape(table));
    match order_by.map(str::trim).filter(|o| !o.is_empty()) {
        Some(clause) if is_order_clause(clause) => {
            sql.push_str(" ORDER BY ");
            sql.push_str(clause);
        }
        Some(column) => {
            sql.push_str(" ORDER BY ");
            sql.push_str(&dialect.escape(column));
            if desc {
                sql.push_str(" DESC");
            }
        }
        None => {}
    }
    sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
    sql
}

/// Exact row count of a table
pub fn build_count_query(dialect: Dialect, table: &str) -> String {
    format!("SELECT COUNT(*) FROM {}", dialect.escape(table))
}

fn where_clause(
    dialect: Dialect,
    pk: &[KeyValue],
    first_index: usize,
    placeholder: Placeholder<'_>,
    params: &mut Vec<Value>,
) -> DbResult<String> {
    if pk.is_empty() {
        return Err(DbError::InvalidParams(
            "primary key values are required to identify the row".into(),
        ));
    }
    let conditions: Vec<String> = pk
        .iter()
        .enumerate()
        .map(|(i, kv)| {
            params.push(kv.value.clone());
            format!(
                "{} = {}",
                dialect.escape(&kv.column),
                placeholder(first_index + i, &kv.column)
            )
        })
        .collect();
    Ok(conditions.join(" AND "))
}

/// `UPDATE table SET column = ? WHERE pk = ? [AND ...]`
pub fn build_update(
    dialect: Dialect,
    table: &str,
    column: &str,
    value: &Value,
    pk: &[KeyValue],
    placeholder: Placeholder<'_>,
) -> DbResult<Statement> {
    let mut params = vec![value.clone()];
    let set = format!("{} = {}", dialect.escape(column), placeholder(1, column));
    let filter = where_clause(dialect, pk, 2, placeholder, &mut params)?;
    Ok(Statement {
        sql: format!("UPDATE {} SET {set} WHERE {filter}", dialect.escape(table)),
        params,
    })
}

/// `DELETE FROM table WHERE pk = ? [AND ...]`
pub fn build_delete(
    dialect: Dialect,
    table: &str,
    pk: &[KeyValue],
    placeholder: Placeholder<'_>,
) -> DbResult<Statement> {
    let mut params = Vec::with_capacity(pk.len());
    let filter = where_clause(dialect, pk, 1, placeholder, &mut params)?;
    Ok(Statement {
        sql: format!("DELETE FROM {} WHERE {filter}", dialect.escape(table)),
        params,
    })
}

/// `INSERT INTO table (...) VALUES (...)`.
///
/// Auto-increment columns with a NULL value are left out so the database
/// generates them. When nothing is left the default-values form is used.
pub fn build_insert(
    dialect: Dialect,
    table: &str,
    columns: &[Column],
    values: &[Value],
    placeholder: Placeholder<'_>,
) -> DbResult<Statement> {
    if columns.len() != values.len() {
        return Err(DbError::InvalidParams(format!(
            "{} columns but {} values",
            columns.len(),
            values.len()
        )));
    }

    let table = dialect.escape(table);
    let mut names = Vec::new();
    let mut markers = Vec::new();
    let mut params = Vec::new();
    for (column, value) in columns.iter().zip(values) {
        if column.auto_increment && value.is_null() {
            continue;
        }
        params.push(value.clone());
        names.push(dialect.escape(&column.name));
        markers.push(placeholder(params.len(), &column.name));
    }

    if params.is_empty() {
        return Ok(Statement {
            sql: dialect.insert_defaults(&table),
            params,
        });
    }

    Ok(Statement {
        sql: format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            names.join(", "),
            markers.join(", ")
        ),
        params,
    })
}

/// Statement opening a transaction at `depth` (0 = outermost)
pub fn begin_statement(depth: u32) -> String {
    match depth {
        0 => "BEGIN".to_string(),
        n => format!("SAVEPOINT sp_{n}"),
    }
}

/// Statement committing the innermost level when `depth` levels are open
pub fn commit_statement(depth: u32) -> String {
    match depth {
        0 | 1 => "COMMIT".to_string(),
        n => format!("RELEASE SAVEPOINT sp_{}", n - 1),
    }
}

/// Statement rolling back the innermost level when `depth` levels are open
pub fn rollback_statement(depth: u32) -> String {
    match depth {
        0 | 1 => "ROLLBACK".to_string(),
        n => format!("ROLLBACK TO SAVEPOINT sp_{}", n - 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::database::traits::row::DataType;

    fn positional(dialect: Dialect) -> impl Fn(usize, &str) -> String {
        move |n, _| dialect.placeholder(n)
    }

    #[test]
    fn test_escape_identifier() {
        assert_eq!(escape_identifier("users", QuoteStyle::DoubleQuote), "\"users\"");
        assert_eq!(escape_identifier("a\"b", QuoteStyle::DoubleQuote), "\"a\"\"b\"");
        assert_eq!(escape_identifier("my`tbl", QuoteStyle::Backtick), "`my``tbl`");
        assert_eq!(
            escape_identifier("public.users", QuoteStyle::DoubleQuote),
            "\"public\".\"users\""
        );
        assert_eq!(escape_identifier("a.b.c", QuoteStyle::Backtick), "`a`.`b.c`");
    }

    #[test]
    fn test_is_query_statement() {
        assert!(is_query_statement("SELECT 1"));
        assert!(is_query_statement("  \n\tselect * from t"));
        assert!(is_query_statement("pragma table_info(t)"));
        assert!(is_query_statement("SHOW TABLES"));
        assert!(is_query_statement("describe t"));
        assert!(is_query_statement("EXPLAIN SELECT 1"));
        assert!(is_query_statement("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(is_query_statement(
            "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 5) SELECT count(*) FROM n"
        ));
        assert!(!is_query_statement(
            "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 5) INSERT INTO t SELECT x FROM n"
        ));
        assert!(!is_query_statement("with old AS (SELECT id FROM t) DELETE FROM t WHERE id IN (SELECT id FROM old)"));
        assert!(is_query_statement("WITH update_log AS (SELECT 1 AS y) SELECT y FROM update_log"));
        assert!(is_query_statement("WITH \"x)\" AS (SELECT ')') SELECT * FROM \"x)\""));
        assert!(!is_query_statement("INSERT INTO t VALUES (1)"));
        assert!(!is_query_statement("SELECTED"));
        assert!(!is_query_statement(""));
    }

    #[test]
    fn test_page_query() {
        assert_eq!(
            build_page_query(Dialect::Sqlite, "users", 0, 2, None, false),
            "SELECT * FROM \"users\" LIMIT 2 OFFSET 0"
        );
        assert_eq!(
            build_page_query(Dialect::MySql, "users", 10, 5, Some("name"), true),
            "SELECT * FROM `users` ORDER BY `name` DESC LIMIT 5 OFFSET 10"
        );
        assert_eq!(
            build_page_query(Dialect::Postgres, "s.t", 0, 1, Some("a DESC, b"), false),
            "SELECT * FROM \"s\".\"t\" ORDER BY a DESC, b LIMIT 1 OFFSET 0"
        );
        assert_eq!(
            build_page_query(Dialect::Sqlite, "t", 0, 1, Some("id_desc"), false),
            "SELECT * FROM \"t\" ORDER BY \"id_desc\" LIMIT 1 OFFSET 0"
        );
    }

    #[test]
    fn test_order_clause_detection() {
        assert!(is_order_clause("a, b"));
        assert!(is_order_clause("created_at desc"));
        assert!(is_order_clause("name ASC"));
        assert!(!is_order_clause("descr"));
        assert!(!is_order_clause("id_desc"));
    }

    #[test]
    fn test_update_statement() {
        let ph = positional(Dialect::Postgres);
        let stmt = build_update(
            Dialect::Postgres,
            "users",
            "name",
            &Value::Text("Bobby".into()),
            &[KeyValue::new("id", 2i64)],
            &ph,
        )
        .unwrap();
        assert_eq!(stmt.sql, "UPDATE \"users\" SET \"name\" = $1 WHERE \"id\" = $2");
        assert_eq!(stmt.params, vec![Value::Text("Bobby".into()), Value::Int64(2)]);
    }

    #[test]
    fn test_mutations_require_primary_key() {
        let ph = positional(Dialect::Sqlite);
        let err = build_delete(Dialect::Sqlite, "users", &[], &ph).unwrap_err();
        assert!(matches!(err, DbError::InvalidParams(_)));
    }

    #[test]
    fn test_composite_key_delete() {
        let ph = positional(Dialect::MySql);
        let stmt = build_delete(
            Dialect::MySql,
            "memberships",
            &[KeyValue::new("user_id", 1i64), KeyValue::new("team_id", 9i64)],
            &ph,
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "DELETE FROM `memberships` WHERE `user_id` = ? AND `team_id` = ?"
        );
        assert_eq!(stmt.params.len(), 2);
    }

    #[test]
    fn test_insert_skips_generated_columns() {
        let columns = vec![
            Column::new("id", "INTEGER").with_auto_increment(true),
            Column::new("name", "TEXT"),
        ];
        let values = vec![Value::Null(DataType::Int), Value::Text("Dana".into())];
        let ph = positional(Dialect::Sqlite);
        let stmt = build_insert(Dialect::Sqlite, "users", &columns, &values, &ph).unwrap();
        assert_eq!(stmt.sql, "INSERT INTO \"users\" (\"name\") VALUES (?)");
        assert_eq!(stmt.params, vec![Value::Text("Dana".into())]);
    }

    #[test]
    fn test_insert_all_defaults() {
        let columns = vec![Column::new("id", "INTEGER").with_auto_increment(true)];
        let values = vec![Value::Null(DataType::Int)];

        let ph = positional(Dialect::Sqlite);
        let stmt = build_insert(Dialect::Sqlite, "seq", &columns, &values, &ph).unwrap();
        assert_eq!(stmt.sql, "INSERT INTO \"seq\" DEFAULT VALUES");
        assert!(stmt.params.is_empty());

        let ph = positional(Dialect::MySql);
        let stmt = build_insert(Dialect::MySql, "seq", &columns, &values, &ph).unwrap();
        assert_eq!(stmt.sql, "INSERT INTO `seq` () VALUES ()");
    }

    #[test]
    fn test_insert_custom_placeholder() {
        let columns = vec![Column::new("id", "uuid")];
        let values = vec![Value::Text("0000".into())];
        let ph = |n: usize, _: &str| format!("CAST(${n} AS uuid)");
        let stmt = build_insert(Dialect::Postgres, "t", &columns, &values, &ph).unwrap();
        assert_eq!(stmt.sql, "INSERT INTO \"t\" (\"id\") VALUES (CAST($1 AS uuid))");
    }

    #[test]
    fn test_transaction_statements() {
        assert_eq!(begin_statement(0), "BEGIN");
        assert_eq!(begin_statement(1), "SAVEPOINT sp_1");
        assert_eq!(commit_statement(1), "COMMIT");
        assert_eq!(commit_statement(2), "RELEASE SAVEPOINT sp_1");
        assert_eq!(rollback_statement(1), "ROLLBACK");
        assert_eq!(rollback_statement(3), "ROLLBACK TO SAVEPOINT sp_2");
    }
}
