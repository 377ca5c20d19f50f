use std::fmt;

use serde::{Deserialize, Serialize};

/// A fully qualified MySQL table name.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    /// The schema (database) containing the table.
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> TableName {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Returns the name quoted with backticks, safe to splice into SQL.
    pub fn as_quoted_identifier(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.name)
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Quotes an identifier with backticks, doubling embedded backticks.
pub fn quote_identifier(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

/// Column classes the binlog decoder distinguishes.
///
/// Every value conversion is a function of the raw value and this class.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Number,
    MediumInt,
    Float,
    Decimal,
    Enum,
    Set,
    String,
    Binary,
    Date,
    Datetime,
    Timestamp,
    Time,
    Bit,
    Json,
    Point,
}

impl ColumnType {
    /// Classifies a column from `information_schema.columns.data_type`.
    pub fn from_data_type(data_type: &str) -> ColumnType {
        match data_type.to_ascii_lowercase().as_str() {
            "tinyint" | "smallint" | "int" | "integer" | "bigint" | "year" => ColumnType::Number,
            "mediumint" => ColumnType::MediumInt,
            "float" | "double" | "real" => ColumnType::Float,
            "decimal" | "numeric" => ColumnType::Decimal,
            "enum" => ColumnType::Enum,
            "set" => ColumnType::Set,
            "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
                ColumnType::Binary
            }
            "date" => ColumnType::Date,
            "datetime" => ColumnType::Datetime,
            "timestamp" => ColumnType::Timestamp,
            "time" => ColumnType::Time,
            "bit" => ColumnType::Bit,
            "json" => ColumnType::Json,
            "point" | "geometry" | "linestring" | "polygon" => ColumnType::Point,
            _ => ColumnType::String,
        }
    }

    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            ColumnType::Date | ColumnType::Datetime | ColumnType::Timestamp
        )
    }
}

/// Metadata of one column.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub typ: ColumnType,
    /// Full declared type, e.g. `enum('a','b')` or `int(10) unsigned`.
    pub raw_type: String,
    /// Labels of an enum column, in declaration order.
    pub enum_values: Vec<String>,
    /// Labels of a set column, in bit order.
    pub set_values: Vec<String>,
    pub nullable: bool,
    pub primary: bool,
    pub unsigned: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, typ: ColumnType) -> ColumnSchema {
        Self {
            name: name.into(),
            typ,
            raw_type: String::new(),
            enum_values: Vec::new(),
            set_values: Vec::new(),
            nullable: true,
            primary: false,
            unsigned: false,
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self.nullable = false;
        self
    }

    pub fn with_enum_values(mut self, values: Vec<String>) -> Self {
        self.enum_values = values;
        self
    }

    pub fn with_set_values(mut self, values: Vec<String>) -> Self {
        self.set_values = values;
        self
    }

    /// Builds a column from the `data_type` and `column_type` columns of `information_schema`.
    pub fn from_information_schema(
        name: String,
        data_type: &str,
        column_type: &str,
        nullable: bool,
        primary: bool,
    ) -> ColumnSchema {
        let typ = ColumnType::from_data_type(data_type);
        let labels = match typ {
            ColumnType::Enum | ColumnType::Set => parse_labels(column_type),
            _ => Vec::new(),
        };
        let (enum_values, set_values) = match typ {
            ColumnType::Enum => (labels, Vec::new()),
            ColumnType::Set => (Vec::new(), labels),
            _ => (Vec::new(), Vec::new()),
        };

        Self {
            name,
            typ,
            raw_type: column_type.to_string(),
            enum_values,
            set_values,
            nullable,
            primary,
            unsigned: column_type.to_ascii_lowercase().contains("unsigned"),
        }
    }
}

/// Extracts the quoted labels of `enum('a','b')` or `set('x','y')`.
fn parse_labels(column_type: &str) -> Vec<String> {
    let Some(start) = column_type.find('(') else {
        return Vec::new();
    };
    let Some(end) = column_type.rfind(')') else {
        return Vec::new();
    };
    if end <= start {
        return Vec::new();
    }

    let body = &column_type[start + 1..end];
    let mut labels = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' if in_quotes && chars.peek() == Some(&'\'') => {
                current.push('\'');
                chars.next();
            }
            '\'' => in_quotes = !in_quotes,
            ',' if !in_quotes => labels.push(std::mem::take(&mut current)),
            _ if in_quotes => current.push(c),
            _ => {}
        }
    }
    labels.push(current);

    labels
}

/// Metadata of a table: its name and ordered columns.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: TableName,
    pub column_schemas: Vec<ColumnSchema>,
    /// Indexes into [`TableSchema::column_schemas`] of the primary key columns.
    pub primary_key: Vec<usize>,
}

impl TableSchema {
    pub fn new(name: TableName, column_schemas: Vec<ColumnSchema>) -> Self {
        let primary_key = column_schemas
            .iter()
            .enumerate()
            .filter(|(_, column)| column.primary)
            .map(|(index, _)| index)
            .collect();

        Self {
            name,
            column_schemas,
            primary_key,
        }
    }

    pub fn num_columns(&self) -> usize {
        self.column_schemas.len()
    }

    /// Position of the column named `name`, compared case-insensitively.
    pub fn find_column_index(&self, name: &str) -> Option<usize> {
        self.column_schemas
            .iter()
            .position(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnSchema> {
        self.find_column_index(name)
            .map(|index| &self.column_schemas[index])
    }

    /// The primary key column when the key has exactly one column.
    pub fn single_primary_key(&self) -> Option<&ColumnSchema> {
        match self.primary_key.as_slice() {
            [index] => self.column_schemas.get(*index),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_lookup_is_case_insensitive() {
        let schema = TableSchema::new(
            TableName::new("shop", "users"),
            vec![
                ColumnSchema::new("Id", ColumnType::Number).primary(),
                ColumnSchema::new("UserName", ColumnType::String),
            ],
        );

        assert_eq!(schema.find_column_index("username"), Some(1));
        assert_eq!(schema.find_column_index("ID"), Some(0));
        assert_eq!(schema.find_column_index("email"), None);
        assert_eq!(schema.single_primary_key().unwrap().name, "Id");
    }

    #[test]
    fn parses_enum_and_set_labels() {
        let column = ColumnSchema::from_information_schema(
            "state".to_string(),
            "enum",
            "enum('new','it''s done','a,b')",
            false,
            false,
        );
        assert_eq!(column.enum_values, vec!["new", "it's done", "a,b"]);

        let column = ColumnSchema::from_information_schema(
            "tags".to_string(),
            "set",
            "set('red','green')",
            true,
            false,
        );
        assert_eq!(column.set_values, vec!["red", "green"]);
        assert!(column.enum_values.is_empty());
    }

    #[test]
    fn quotes_identifiers() {
        let name = TableName::new("shop", "odd`name");
        assert_eq!(name.as_quoted_identifier(), "`shop`.`odd``name`");
    }
}
