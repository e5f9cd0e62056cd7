//! Table schema types
//!
//! A table schema is an explicit, ordered list of columns supplied by the
//! caller. The JSON form of a column is `{"name": "id", "type": "int", "mode": "required"}`;
//! struct columns carry their nested columns under `fields`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Maximum length of a column name accepted by the warehouse
pub const MAX_COLUMN_NAME_LEN: usize = 300;

/// Column type understood by the warehouse
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogicalType {
    /// Boolean type
    Bool,

    /// 64-bit integer
    Int,

    /// 64-bit floating point
    Float,

    /// Exact numeric with optional precision and scale
    Decimal {
        #[serde(default)]
        precision: Option<u16>,
        #[serde(default)]
        scale: Option<u16>,
    },

    /// UTF-8 text
    String,

    /// Raw bytes (base64 on the wire)
    Bytes,

    /// Calendar date
    Date,

    /// Time of day
    Time,

    /// Civil date and time without time zone
    Datetime,

    /// Absolute point in time
    Timestamp,

    /// JSON document
    Json,

    /// Record with named fields
    Struct {
        fields: Vec<Column>,
    },
}

impl std::fmt::Display for LogicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool => write!(f, "BOOL"),
            Self::Int => write!(f, "INT64"),
            Self::Float => write!(f, "FLOAT64"),
            Self::Decimal { precision, scale } => {
                match (precision, scale) {
                    (Some(p), Some(s)) => write!(f, "NUMERIC({}, {})", p, s),
                    (Some(p), None) => write!(f, "NUMERIC({})", p),
                    _ => write!(f, "NUMERIC"),
                }
            }
            Self::String => write!(f, "STRING"),
            Self::Bytes => write!(f, "BYTES"),
            Self::Date => write!(f, "DATE"),
            Self::Time => write!(f, "TIME"),
            Self::Datetime => write!(f, "DATETIME"),
            Self::Timestamp => write!(f, "TIMESTAMP"),
            Self::Json => write!(f, "JSON"),
            Self::Struct { .. } => write!(f, "STRUCT"),
        }
    }
}

/// Column mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Value may be null
    #[default]
    #[serde(alias = "NULLABLE")]
    Nullable,

    /// Value must be present
    #[serde(alias = "REQUIRED")]
    Required,

    /// Array of values
    #[serde(alias = "REPEATED")]
    Repeated,
}

impl Mode {
    /// Wire name of the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nullable => "NULLABLE",
            Self::Required => "REQUIRED",
            Self::Repeated => "REPEATED",
        }
    }
}

/// A column in a table schema
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,

    /// Column type
    #[serde(flatten)]
    pub logical_type: LogicalType,

    /// Column mode
    #[serde(default)]
    pub mode: Mode,

    /// Optional human readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Column {
    /// Create a new nullable column
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            mode: Mode::Nullable,
            description: None,
        }
    }

    /// Set mode
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Mark the column as required
    pub fn required(self) -> Self {
        self.with_mode(Mode::Required)
    }

    /// Mark the column as repeated
    pub fn repeated(self) -> Self {
        self.with_mode(Mode::Repeated)
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// An ordered collection of columns
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    /// Ordered list of columns
    pub columns: Vec<Column>,
}

impl Schema {
    /// Create a new empty schema
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
        }
    }

    /// Create a schema from columns
    pub fn from_columns(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Find a column by name
    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Get column names
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Number of top-level columns
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Load a schema from its JSON form: either `{"columns": [...]}` or a bare column array
    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| SchemaError::Parse(e.to_string()))?;

        let schema = if value.is_array() {
            let columns: Vec<Column> = serde_json::from_value(value)
                .map_err(|e| SchemaError::Parse(e.to_string()))?;
            Schema::from_columns(columns)
        } else {
            serde_json::from_value(value)
                .map_err(|e| SchemaError::Parse(e.to_string()))?
        };

        schema.validate()?;
        Ok(schema)
    }

    /// Check that the schema can be used to create a table
    ///
    /// Column names are compared case-insensitively, the way the warehouse does.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.columns.is_empty() {
            return Err(SchemaError::Empty);
        }
        validate_columns(&self.columns, "")
    }

    /// Derive a schema from the shape of a JSON object sample
    ///
    /// Strings map to `String`, integers to `Int`, other numbers to `Float`,
    /// booleans to `Bool`, objects to `Struct` and arrays to a repeated column
    /// of their first non-null element's type. Every inferred column is
    /// nullable since a single sample cannot show that a field is always set.
    /// Columns come out in the object's key order.
    pub fn infer_from_json(sample: &serde_json::Value) -> Result<Self, SchemaError> {
        let object = sample.as_object().ok_or_else(|| {
            SchemaError::UnsupportedSample("sample must be a JSON object".to_string())
        })?;

        let columns = infer_columns(object, "")?;
        let schema = Schema::from_columns(columns);
        schema.validate()?;
        Ok(schema)
    }
}

fn infer_columns(
    object: &serde_json::Map<String, serde_json::Value>,
    prefix: &str,
) -> Result<Vec<Column>, SchemaError> {
    object
        .iter()
        .map(|(name, value)| infer_column(name, value, prefix))
        .collect()
}

fn infer_column(name: &str, value: &serde_json::Value, prefix: &str) -> Result<Column, SchemaError> {
    use serde_json::Value;

    let path = format!("{}{}", prefix, name);
    match value {
        Value::Array(items) => {
            let element = items.iter().find(|v| !v.is_null()).ok_or_else(|| {
                SchemaError::UnsupportedSample(format!(
                    "cannot infer element type of empty array '{}'",
                    path
                ))
            })?;
            if element.is_array() {
                return Err(SchemaError::UnsupportedSample(format!(
                    "nested arrays are not supported ('{}')",
                    path
                )));
            }
            Ok(infer_column(name, element, prefix)?.repeated())
        }
        other => Ok(Column::new(name, infer_type(other, &path)?)),
    }
}

fn infer_type(value: &serde_json::Value, path: &str) -> Result<LogicalType, SchemaError> {
    use serde_json::Value;

    match value {
        Value::Bool(_) => Ok(LogicalType::Bool),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(LogicalType::Int),
        Value::Number(_) => Ok(LogicalType::Float),
        Value::String(_) => Ok(LogicalType::String),
        Value::Object(fields) => {
            let fields = infer_columns(fields, &format!("{}.", path))?;
            Ok(LogicalType::Struct { fields })
        }
        Value::Null => Err(SchemaError::UnsupportedSample(format!(
            "cannot infer type of null field '{}'",
            path
        ))),
        Value::Array(_) => Err(SchemaError::UnsupportedSample(format!(
            "nested arrays are not supported ('{}')",
            path
        ))),
    }
}

fn validate_columns(columns: &[Column], prefix: &str) -> Result<(), SchemaError> {
    let mut seen = HashSet::new();

    for column in columns {
        let path = format!("{}{}", prefix, column.name);
        if !is_valid_column_name(&column.name) {
            return Err(SchemaError::InvalidName(path));
        }
        if !seen.insert(column.name.to_lowercase()) {
            return Err(SchemaError::DuplicateColumn(path));
        }
        if let LogicalType::Struct { fields } = &column.logical_type {
            if fields.is_empty() {
                return Err(SchemaError::EmptyStruct(path));
            }
            validate_columns(fields, &format!("{}.", path))?;
        }
    }

    Ok(())
}

fn is_valid_column_name(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    starts_ok
        && name.len() <= MAX_COLUMN_NAME_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Schema errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("Schema has no columns")]
    Empty,

    #[error("Invalid column name: {0}")]
    InvalidName(String),

    #[error("Duplicate column: {0}")]
    DuplicateColumn(String),

    #[error("Struct column has no fields: {0}")]
    EmptyStruct(String),

    #[error("Cannot infer schema from sample: {0}")]
    UnsupportedSample(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
