//! Conversions from raw binlog values to the JSON values handed to rules and destinations.

mod column;
mod text;

pub use column::{DateFormats, convert_column_data};
pub use text::{render_plain, to_camel_case};
