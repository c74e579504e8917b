//! Database-agnostic row and value types.
//!
//! This module contains:
//! - `DataType` - The coarse type family of a column or value
//! - `Value` - A unified value type that can represent any database value
//! - `Column` - Metadata about a column in a result set or table
//! - `Row` - An ordered list of values
//! - `ResultSet` - Columns, rows and counters returned by a query

use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Largest text or blob payload materialized for a single field (1 MiB).
pub const MAX_FIELD_SIZE: usize = 1024 * 1024;

/// Default cap on rows materialized by a single query.
pub const MAX_RESULT_ROWS: usize = 1_048_576;

/// Largest integer magnitude that a JSON number carries without loss.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Coarse type family shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Null,
    Bool,
    Int,
    Float,
    Text,
    Blob,
    Date,
    Timestamp,
}

impl DataType {
    /// Classify a declared or reported column type name.
    ///
    /// Uses SQLite-style affinity rules, which also cover the names reported
    /// by Postgres and MySQL.
    pub fn from_type_name(type_name: &str) -> Self {
        let upper = type_name.to_ascii_uppercase();
        let upper = upper.trim();

        if upper.is_empty() || upper == "NULL" {
            return DataType::Null;
        }
        if upper.starts_with("BOOL") || upper == "TINYINT(1)" || upper == "BIT" {
            return DataType::Bool;
        }
        if upper.starts_with("TIMESTAMP") || upper.starts_with("DATETIME") {
            return DataType::Timestamp;
        }
        if upper == "DATE" {
            return DataType::Date;
        }
        if upper.contains("INT") || upper == "SERIAL" || upper == "BIGSERIAL" || upper == "OID" {
            return DataType::Int;
        }
        if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            return DataType::Text;
        }
        if upper.contains("BLOB") || upper.contains("BINARY") || upper == "BYTEA" {
            return DataType::Blob;
        }
        if upper.contains("REAL")
            || upper.contains("FLOA")
            || upper.contains("DOUB")
            || upper.contains("NUMERIC")
            || upper.contains("DECIMAL")
        {
            return DataType::Float;
        }
        DataType::Text
    }
}

/// A unified value type that can represent any database value across all supported databases.
///
/// Integers beyond the JSON-safe range and NUMERIC values that do not fit a
/// double are carried as [`Value::Text`] so that no digits are lost.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// NULL, tagged with the type of the column it came from
    Null(DataType),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Text(String),
    Blob(Vec<u8>),
    /// A field whose payload exceeded [`MAX_FIELD_SIZE`] and was not materialized
    Oversized { data_type: DataType, len: usize },
}

impl Value {
    /// Text value, replaced by a placeholder when larger than [`MAX_FIELD_SIZE`]
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.len() > MAX_FIELD_SIZE {
            Value::Oversized {
                data_type: DataType::Text,
                len: value.len(),
            }
        } else {
            Value::Text(value)
        }
    }

    /// Blob value, replaced by a placeholder when larger than [`MAX_FIELD_SIZE`]
    pub fn blob(value: Vec<u8>) -> Self {
        if value.len() > MAX_FIELD_SIZE {
            Value::Oversized {
                data_type: DataType::Blob,
                len: value.len(),
            }
        } else {
            Value::Blob(value)
        }
    }

    /// Parse an integer rendered as text. Anything that is not a clean i64 stays text.
    pub fn from_integer_text(text: &str) -> Self {
        match text.parse::<i64>() {
            Ok(v) => Value::Int64(v),
            Err(_) => Value::text(text),
        }
    }

    /// Parse a float rendered as text. Non-finite or unparsable input stays text.
    pub fn from_float_text(text: &str) -> Self {
        match text.parse::<f64>() {
            Ok(v) if v.is_finite() => Value::Float64(v),
            _ => Value::text(text),
        }
    }

    /// Parse a NUMERIC/DECIMAL rendering, keeping it as text whenever a
    /// double would lose digits.
    pub fn from_decimal_text(text: &str) -> Self {
        if !text.contains(['.', 'e', 'E']) {
            return Value::from_integer_text(text);
        }
        let digits = text.chars().filter(char::is_ascii_digit).count();
        if digits > 15 {
            return Value::text(text);
        }
        Value::from_float_text(text)
    }

    /// Check if this value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null(_))
    }

    /// The type family of this value
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null(t) => *t,
            Value::Bool(_) => DataType::Bool,
            Value::Int64(_) => DataType::Int,
            Value::Float64(_) => DataType::Float,
            Value::Text(_) => DataType::Text,
            Value::Blob(_) => DataType::Blob,
            Value::Oversized { data_type, .. } => *data_type,
        }
    }

    /// Convert this value to a display string
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null(_) => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int64(v) => v.to_string(),
            Value::Float64(v) => v.to_string(),
            Value::Text(s) => s.clone(),
            Value::Blob(b) => format!("\\x{}", hex::encode(b)),
            Value::Oversized { data_type, len } => oversized_placeholder(*data_type, *len),
        }
    }

    /// Try to get this value as an i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::Bool(b) => Some(*b as i64),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// JSON encoding used on the wire.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null(_) => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int64(v) if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(v) => {
                Json::from(*v)
            }
            Value::Int64(v) => Json::String(v.to_string()),
            Value::Float64(v) => serde_json::Number::from_f64(*v)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Text(s) => Json::String(s.clone()),
            Value::Blob(b) => Json::String(hex::encode(b)),
            Value::Oversized { data_type, len } => {
                Json::String(oversized_placeholder(*data_type, *len))
            }
        }
    }

    /// Decode a JSON value without type information.
    ///
    /// Numbers become `Int64` when they are exact integers that fit, otherwise `Float64`.
    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null(DataType::Null),
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int64(i),
                None => {
                    let f = n.as_f64().unwrap_or(f64::NAN);
                    // i64::MAX as f64 rounds up to 2^63, which is out of range
                    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64
                    {
                        Value::Int64(f as i64)
                    } else {
                        Value::Float64(f)
                    }
                }
            },
            Json::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        }
    }

    /// Decode a JSON value for a column of known type.
    ///
    /// Restores typed NULLs, hex-encoded blobs and integers that were sent as strings.
    pub fn from_json_typed(json: &serde_json::Value, data_type: DataType) -> Self {
        use serde_json::Value as Json;
        match (json, data_type) {
            (Json::Null, t) => Value::Null(t),
            (Json::String(s), DataType::Blob) => match hex::decode(s) {
                Ok(bytes) => Value::Blob(bytes),
                Err(_) => Value::Text(s.clone()),
            },
            (Json::String(s), DataType::Int) => Value::from_integer_text(s),
            _ => Value::from_json(json),
        }
    }
}

fn oversized_placeholder(data_type: DataType, len: usize) -> String {
    let name = match data_type {
        DataType::Blob => "BLOB",
        _ => "TEXT",
    };
    format!("[{name} {len} bytes]")
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null(DataType::Null)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(|json| Value::from_json(&json))
    }
}

// Convenient From implementations
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null(DataType::Null),
        }
    }
}

/// Metadata about a column in a query result or table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Type family
    pub data_type: DataType,
    /// Database-specific type name
    pub type_name: String,
    /// Whether the column allows NULL values
    pub nullable: bool,
    /// Part of the primary key
    pub primary_key: bool,
    /// Value generated by the database on insert
    pub auto_increment: bool,
    /// Default expression, as the database reports it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// Referenced column as `table.column`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
    /// Declared maximum length for character types
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<i64>,
}

impl Column {
    /// Create a new column; the type family is derived from the type name
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            name: name.into(),
            data_type: DataType::from_type_name(&type_name),
            type_name,
            nullable: true,
            primary_key: false,
            auto_increment: false,
            default_value: None,
            foreign_key: None,
            max_length: None,
        }
    }

    /// Set the nullable flag
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Mark as part of the primary key
    pub fn with_primary_key(mut self, primary_key: bool) -> Self {
        self.primary_key = primary_key;
        self
    }

    /// Mark as generated by the database
    pub fn with_auto_increment(mut self, auto_increment: bool) -> Self {
        self.auto_increment = auto_increment;
        self
    }

    /// Set the default expression
    pub fn with_default(mut self, default_value: Option<String>) -> Self {
        self.default_value = default_value;
        self
    }

    /// Set the declared maximum length
    pub fn with_max_length(mut self, max_length: Option<i64>) -> Self {
        self.max_length = max_length;
        self
    }
}

/// A row of values from a query result
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    /// Create a row from values
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Get the number of values in this row
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if this row is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by index
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Iterate over values
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }
}

impl IntoIterator for Row {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

/// Columns, rows and counters returned by a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
    /// Rows the statement produced, which may exceed `rows.len()` when capped
    pub total_rows: i64,
    /// Rows changed by the statement, `-1` for queries
    pub rows_affected: i64,
}

impl ResultSet {
    /// Empty result for a query with the given columns
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            total_rows: 0,
            rows_affected: -1,
        }
    }

    /// Count a produced row, keeping it only while fewer than `cap` rows are held.
    ///
    /// Returns whether the row was kept.
    pub fn push_row(&mut self, row: Row, cap: usize) -> bool {
        self.total_rows += 1;
        if self.rows.len() < cap {
            self.rows.push(row);
            true
        } else {
            false
        }
    }

    /// Number of materialized rows
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Whether some produced rows were not materialized
    pub fn is_truncated(&self) -> bool {
        self.total_rows > self.rows.len() as i64
    }

    /// First value of the first row
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.get(0))
    }
}

impl Serialize for ResultSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ResultSet", 5)?;
        state.serialize_field("columns", &self.columns)?;
        state.serialize_field("rows", &self.rows)?;
        state.serialize_field("num_rows", &self.num_rows())?;
        state.serialize_field("total_rows", &self.total_rows)?;
        state.serialize_field("rows_affected", &self.rows_affected)?;
        state.end()
    }
}
