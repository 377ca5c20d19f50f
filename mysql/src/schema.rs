//! Table metadata loading from `information_schema`.

use sqlx::{MySqlPool, Row};
use thiserror::Error;
use tracing::debug;

use crate::types::{ColumnSchema, TableName, TableSchema};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("table {0} not found")]
    TableNotFound(TableName),
}

const TABLE_COLUMNS_QUERY: &str = r#"
    SELECT
        c.column_name AS column_name,
        c.data_type AS data_type,
        c.column_type AS column_type,
        c.is_nullable AS is_nullable,
        CASE WHEN c.column_key = 'PRI' THEN 1 ELSE 0 END AS is_primary
    FROM information_schema.columns c
    WHERE c.table_schema = ?
    AND c.table_name = ?
    ORDER BY c.ordinal_position
"#;

/// Loads the ordered column metadata of `table_name`.
pub async fn get_table_schema(
    pool: &MySqlPool,
    table_name: &TableName,
) -> Result<TableSchema, SchemaError> {
    let rows = sqlx::query(TABLE_COLUMNS_QUERY)
        .bind(&table_name.schema)
        .bind(&table_name.name)
        .fetch_all(pool)
        .await?;

    if rows.is_empty() {
        return Err(SchemaError::TableNotFound(table_name.clone()));
    }

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let column_name: String = row.try_get("column_name")?;
        let data_type: String = row.try_get("data_type")?;
        let column_type: String = row.try_get("column_type")?;
        let is_nullable: String = row.try_get("is_nullable")?;
        let is_primary: i64 = row.try_get("is_primary")?;

        columns.push(ColumnSchema::from_information_schema(
            column_name,
            &data_type,
            &column_type,
            is_nullable == "YES",
            is_primary == 1,
        ));
    }

    debug!(table = %table_name, columns = columns.len(), "loaded table schema");

    Ok(TableSchema::new(table_name.clone(), columns))
}
