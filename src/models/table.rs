// Telemetry table definitions shared by the recorder and every sink

//! # Table Definitions
//!
//! Telemetry sinks all speak the same schema language: a table has a name, a
//! schema (namespace) and typed, optionally nullable columns. The relational
//! sink turns it into DDL, the delimited-file sink into a header row and the
//! publish/subscribe sink into a topic name.

use serde::{Deserialize, Serialize};

/// A single telemetry row: column name to JSON value
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Column data types understood by the sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Int,
    BigInt,
    Text,
    Varchar,
    Date,
    Boolean,
    Float,
    Json,
    Uuid,
    Timestamp,
}

impl ColumnType {
    /// PostgreSQL type name used when creating tables
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Int => "INTEGER",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Text => "TEXT",
            ColumnType::Varchar => "VARCHAR",
            ColumnType::Date => "DATE",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::Json => "JSONB",
            ColumnType::Uuid => "UUID",
            ColumnType::Timestamp => "TIMESTAMPTZ",
        }
    }
}

/// One typed column of a telemetry table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDefinition {
    /// A column that every record must provide
    pub fn required<S: Into<String>>(name: S, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    /// A column records may omit
    pub fn optional<S: Into<String>>(name: S, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }
}

/// A telemetry table: schema-qualified name plus ordered columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub schema: String,
    pub columns: Vec<ColumnDefinition>,
}

impl TableDefinition {
    pub fn new<N: Into<String>, S: Into<String>>(
        name: N,
        schema: S,
        columns: Vec<ColumnDefinition>,
    ) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
            columns,
        }
    }

    /// `schema.name`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Column names in declaration order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Names of required columns missing from `record` or set to `null`
    pub fn missing_columns(&self, record: &Record) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| !c.nullable && record.get(&c.name).map_or(true, |v| v.is_null()))
            .map(|c| c.name.clone())
            .collect()
    }

    /// Keep only the values for declared columns
    pub fn project(&self, record: &Record) -> Record {
        self.columns
            .iter()
            .filter_map(|c| record.get(&c.name).map(|v| (c.name.clone(), v.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_table() -> TableDefinition {
        TableDefinition::new(
            "quality_checks",
            "test",
            vec![
                ColumnDefinition::required("part_id", ColumnType::Text),
                ColumnDefinition::required("quality_value", ColumnType::Int),
                ColumnDefinition::optional("note", ColumnType::Text),
            ],
        )
    }

    #[test]
    fn test_qualified_name_and_columns() {
        let table = sample_table();
        assert_eq!(table.qualified_name(), "test.quality_checks");
        assert_eq!(table.column_names(), vec!["part_id", "quality_value", "note"]);
    }

    #[test]
    fn test_missing_columns_ignores_nullable() {
        let table = sample_table();
        let mut record = Record::new();
        record.insert("part_id".into(), json!("part1"));

        assert_eq!(table.missing_columns(&record), vec!["quality_value".to_string()]);

        record.insert("quality_value".into(), json!(9));
        assert!(table.missing_columns(&record).is_empty());
    }

    #[test]
    fn test_null_required_value_counts_as_missing() {
        let table = sample_table();
        let mut record = Record::new();
        record.insert("part_id".into(), serde_json::Value::Null);
        record.insert("quality_value".into(), json!(9));

        assert_eq!(table.missing_columns(&record), vec!["part_id".to_string()]);
    }

    #[test]
    fn test_project_drops_undeclared_values() {
        let table = sample_table();
        let mut record = Record::new();
        record.insert("part_id".into(), json!("part1"));
        record.insert("quality_value".into(), json!(9));
        record.insert("unexpected".into(), json!(true));

        let projected = table.project(&record);
        assert_eq!(projected.len(), 2);
        assert!(!projected.contains_key("unexpected"));
    }
}
