use std::future::Future;

use mysql::types::{BinlogValue, ColumnSchema, ColumnType, TableSchema, quote_identifier};
use sqlx::mysql::MySqlRow;
use sqlx::{MySqlPool, Row};
use tracing::debug;

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;

/// Paged, ordered reads of a source table.
pub trait TableScanner {
    /// Number of rows in `table`.
    fn count(&self, table: &TableSchema) -> impl Future<Output = EtlResult<u64>> + Send;

    /// Rows `offset..offset + limit` of `table` ordered by `order_column`.
    ///
    /// Every row has one value per column of `table`, in column order, encoded the way the
    /// binlog decoder encodes them.
    fn fetch_page(
        &self,
        table: &TableSchema,
        order_column: &str,
        offset: u64,
        limit: u64,
    ) -> impl Future<Output = EtlResult<Vec<Vec<BinlogValue>>>> + Send;
}

/// [`TableScanner`] over a MySQL connection pool.
#[derive(Debug, Clone)]
pub struct MySqlTableScanner {
    pool: MySqlPool,
}

impl MySqlTableScanner {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

impl TableScanner for MySqlTableScanner {
    async fn count(&self, table: &TableSchema) -> EtlResult<u64> {
        let query = format!("SELECT COUNT(*) FROM {}", table.name.as_quoted_identifier());
        let count: i64 = sqlx::query_scalar(&query).fetch_one(&self.pool).await?;

        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn fetch_page(
        &self,
        table: &TableSchema,
        order_column: &str,
        offset: u64,
        limit: u64,
    ) -> EtlResult<Vec<Vec<BinlogValue>>> {
        let query = page_query(table, order_column)?;
        debug!(table = %table.name, offset, limit, "fetching export page");

        let rows = sqlx::query(&query)
            .bind(offset)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| decode_row(row, table.num_columns()))
            .collect()
    }
}

/// Builds the page query of `table`. Binds the offset, then the limit.
///
/// A single-column primary key pages through the key index first and joins the full rows
/// afterwards, which keeps deep offsets cheap. Other tables use a plain ordered scan.
pub fn page_query(table: &TableSchema, order_column: &str) -> EtlResult<String> {
    let Some(order) = table.find_column(order_column) else {
        return Err(etl_error!(
            ErrorKind::MissingOrderColumn,
            "Order column not found",
            format!("Table {} has no column '{order_column}'", table.name)
        ));
    };
    let order = quote_identifier(&order.name);
    let table_name = table.name.as_quoted_identifier();

    match table.single_primary_key() {
        Some(primary_key) => {
            let primary_key = quote_identifier(&primary_key.name);
            let projection = projection(table, "b.");

            Ok(format!(
                "SELECT {projection} FROM (SELECT {primary_key} FROM {table_name} ORDER BY {order} LIMIT ?, ?) a \
                 JOIN {table_name} b ON a.{primary_key} = b.{primary_key}"
            ))
        }
        None => {
            let projection = projection(table, "");

            Ok(format!(
                "SELECT {projection} FROM {table_name} ORDER BY {order} LIMIT ?, ?"
            ))
        }
    }
}

/// Select list reproducing the binlog encoding of each column.
fn projection(table: &TableSchema, prefix: &str) -> String {
    table
        .column_schemas
        .iter()
        .map(|column| column_expression(column, prefix))
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_expression(column: &ColumnSchema, prefix: &str) -> String {
    let name = quote_identifier(&column.name);
    let qualified = format!("{prefix}{name}");

    match column.typ {
        ColumnType::Date
        | ColumnType::Datetime
        | ColumnType::Timestamp
        | ColumnType::Time
        | ColumnType::Decimal
        | ColumnType::Json => format!("CAST({qualified} AS CHAR) AS {name}"),
        // Enums and sets travel as index and bitmask, bits as integers.
        ColumnType::Enum | ColumnType::Set | ColumnType::Bit => {
            format!("({qualified} + 0) AS {name}")
        }
        ColumnType::Point => format!("ST_AsText({qualified}) AS {name}"),
        _ => qualified,
    }
}

fn decode_row(row: &MySqlRow, width: usize) -> EtlResult<Vec<BinlogValue>> {
    (0..width).map(|index| decode_value(row, index)).collect()
}

fn decode_value(row: &MySqlRow, index: usize) -> EtlResult<BinlogValue> {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return Ok(value.into());
    }
    if let Ok(value) = row.try_get::<Option<u64>, _>(index) {
        return Ok(value.into());
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return Ok(value.into());
    }
    if let Ok(value) = row.try_get::<Option<f32>, _>(index) {
        return Ok(value.map(f64::from).into());
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return Ok(value.into());
    }
    if let Ok(value) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return Ok(value.map_or(BinlogValue::Null, BinlogValue::Bytes));
    }

    Err(etl_error!(
        ErrorKind::ConversionError,
        "Unsupported column value in export page",
        format!("Column {index} could not be decoded")
    ))
}
