use config::shared::RuleConfig;
use mysql::types::{ColumnSchema, ColumnType, TableName, TableSchema};

/// `shop.users(id PK, name)`.
pub fn users_table_schema() -> TableSchema {
    TableSchema::new(
        TableName::new("shop", "users"),
        vec![
            ColumnSchema::new("id", ColumnType::Number).primary(),
            ColumnSchema::new("name", ColumnType::String),
        ],
    )
}

/// `shop.users` after `ALTER TABLE users ADD COLUMN email`.
pub fn users_table_schema_with_email() -> TableSchema {
    let mut schema = users_table_schema();
    schema
        .column_schemas
        .push(ColumnSchema::new("email", ColumnType::String));

    schema
}

/// `shop.orders` with a composite primary key `(order_id, line)`.
pub fn orders_table_schema() -> TableSchema {
    TableSchema::new(
        TableName::new("shop", "orders"),
        vec![
            ColumnSchema::new("order_id", ColumnType::Number).primary(),
            ColumnSchema::new("line", ColumnType::Number).primary(),
            ColumnSchema::new("created_at", ColumnType::Datetime),
            ColumnSchema::new("state", ColumnType::Enum)
                .with_enum_values(vec!["open".to_string(), "paid".to_string()]),
        ],
    )
}

/// A declarative rule for `schema`.
pub fn rule_for(schema: &TableSchema) -> RuleConfig {
    RuleConfig::new(schema.name.schema.clone(), schema.name.name.clone())
}
