mod position;
mod table;
mod value;

pub use position::BinlogPosition;
pub use table::{ColumnSchema, ColumnType, TableName, TableSchema, quote_identifier};
pub use value::BinlogValue;
