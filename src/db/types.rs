// Value and Result Types
// Scalar values flowing into parameters and out of result sets

use indexmap::IndexMap;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// A single scalar value, either bound as a parameter or read from a result row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(String),
    Binary(Vec<u8>),
}

impl Value {
    /// Name of the variant, used in parameter coercion errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::DateTime(_) => "datetime",
            Value::Binary(_) => "binary",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::DateTime(s) => Some(s),
            _ => None,
        }
    }
}

macro_rules! impl_value_from {
    ($($ty:ty => $variant:ident($conv:expr)),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant($conv(v))
                }
            }

            impl From<$ty> for Param {
                fn from(v: $ty) -> Self {
                    Param::Inferred(Value::from(v))
                }
            }

            impl From<Option<$ty>> for Param {
                fn from(v: Option<$ty>) -> Self {
                    Param::Inferred(Value::from(v))
                }
            }
        )*
    };
}

impl_value_from! {
    bool => Bool(|v| v),
    i32 => Int(i64::from),
    i64 => Int(|v| v),
    u8 => Int(i64::from),
    i16 => Int(i64::from),
    f32 => Float(f64::from),
    f64 => Float(|v| v),
    &str => String(str::to_string),
    String => String(|v| v),
    Vec<u8> => Binary(|v| v),
    chrono::NaiveDateTime => DateTime(|v: chrono::NaiveDateTime| v.to_string()),
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Explicit driver-side types for parameters that should not be inferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlType {
    Bit,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Real,
    Float,
    NVarChar,
    VarChar,
    UniqueIdentifier,
    DateTime2,
    Date,
    VarBinary,
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlType::Bit => "bit",
            SqlType::TinyInt => "tinyint",
            SqlType::SmallInt => "smallint",
            SqlType::Int => "int",
            SqlType::BigInt => "bigint",
            SqlType::Real => "real",
            SqlType::Float => "float",
            SqlType::NVarChar => "nvarchar",
            SqlType::VarChar => "varchar",
            SqlType::UniqueIdentifier => "uniqueidentifier",
            SqlType::DateTime2 => "datetime2",
            SqlType::Date => "date",
            SqlType::VarBinary => "varbinary",
        };
        f.write_str(name)
    }
}

/// A query parameter. Plain values let the driver infer the type from the value,
/// typed values are bound with the given SQL type.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Inferred(Value),
    Typed { ty: SqlType, value: Value },
}

impl Param {
    pub fn typed(ty: SqlType, value: impl Into<Value>) -> Self {
        Param::Typed {
            ty,
            value: value.into(),
        }
    }

    pub fn value(&self) -> &Value {
        match self {
            Param::Inferred(value) | Param::Typed { value, .. } => value,
        }
    }

    pub fn sql_type(&self) -> Option<SqlType> {
        match self {
            Param::Inferred(_) => None,
            Param::Typed { ty, .. } => Some(*ty),
        }
    }
}

impl From<Value> for Param {
    fn from(value: Value) -> Self {
        Param::Inferred(value)
    }
}

/// Column metadata for a result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// One result row. Column names are shared by every row of the same result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Look up a value by column name (first match wins for duplicated names)
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }

    pub fn get_index(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.columns.iter().zip(&self.values) {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// Rows returned by one driver request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecordSet {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
}

impl RecordSet {
    pub fn new(columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// Build a record set from column names and raw row values.
    /// Column types are reported as `sql_variant`.
    pub fn from_values(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        let names: Arc<Vec<String>> = Arc::new(columns.iter().map(|c| c.to_string()).collect());
        Self {
            columns: columns
                .iter()
                .map(|c| ColumnInfo::new(*c, "sql_variant"))
                .collect(),
            rows: rows
                .into_iter()
                .map(|values| Row::new(Arc::clone(&names), values))
                .collect(),
        }
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// What a step contributes to the accumulated results.
///
/// Outputs are shared, so handing each later step a snapshot of the results
/// never copies rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StepOutput {
    Rows(Arc<RecordSet>),
    Json(Arc<serde_json::Value>),
}

impl StepOutput {
    pub fn as_rows(&self) -> Option<&RecordSet> {
        match self {
            StepOutput::Rows(rows) => Some(rows.as_ref()),
            StepOutput::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            StepOutput::Json(value) => Some(value.as_ref()),
            StepOutput::Rows(_) => None,
        }
    }
}

impl From<RecordSet> for StepOutput {
    fn from(rows: RecordSet) -> Self {
        StepOutput::Rows(Arc::new(rows))
    }
}

impl From<Arc<RecordSet>> for StepOutput {
    fn from(rows: Arc<RecordSet>) -> Self {
        StepOutput::Rows(rows)
    }
}

impl From<serde_json::Value> for StepOutput {
    fn from(value: serde_json::Value) -> Self {
        StepOutput::Json(Arc::new(value))
    }
}

/// Step alias -> step output, in execution order
pub type Results = IndexMap<String, StepOutput>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_lookup_by_name_and_index() {
        let set = RecordSet::from_values(
            &["id", "name"],
            vec![vec![Value::Int(7), Value::from("seven")]],
        );

        let row = set.first().unwrap();
        assert_eq!(row.get("id"), Some(&Value::Int(7)));
        assert_eq!(row.get("name").and_then(Value::as_str), Some("seven"));
        assert_eq!(row.get_index(1), Some(&Value::String("seven".to_string())));
        assert!(row.get("missing").is_none());
    }

    #[test]
    fn test_row_serializes_as_object() {
        let set = RecordSet::from_values(&["n"], vec![vec![Value::Int(1)]]);
        let json = serde_json::to_value(&set.rows[0]).unwrap();
        assert_eq!(json, serde_json::json!({ "n": 1 }));
    }

    #[test]
    fn test_cloned_output_shares_rows() {
        let output = StepOutput::from(RecordSet::from_values(&["n"], vec![vec![Value::Int(1)]; 1000]));
        let snapshot: Results = [("a".to_string(), output.clone())].into_iter().collect();

        let original = output.as_rows().unwrap();
        let copied = snapshot["a"].as_rows().unwrap();
        assert!(std::ptr::eq(original, copied));
        assert_eq!(copied.len(), 1000);
    }

    #[test]
    fn test_param_from_scalar_is_inferred() {
        assert_eq!(Param::from(5), Param::Inferred(Value::Int(5)));
        assert_eq!(Param::from(None::<String>), Param::Inferred(Value::Null));

        let typed = Param::typed(SqlType::BigInt, 5);
        assert_eq!(typed.sql_type(), Some(SqlType::BigInt));
        assert_eq!(typed.value(), &Value::Int(5));
    }
}
