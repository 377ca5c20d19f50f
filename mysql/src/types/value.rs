use serde::{Deserialize, Serialize};

/// A column value exactly as the binlog decoder delivers it.
///
/// Enum and set columns arrive as their numeric index or bitmask, temporal columns as text,
/// JSON columns as text or bytes. Interpreting them requires the [`super::ColumnSchema`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum BinlogValue {
    Null,
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl BinlogValue {
    pub fn is_null(&self) -> bool {
        matches!(self, BinlogValue::Null)
    }
}

impl From<i64> for BinlogValue {
    fn from(value: i64) -> Self {
        BinlogValue::Signed(value)
    }
}

impl From<u64> for BinlogValue {
    fn from(value: u64) -> Self {
        BinlogValue::Unsigned(value)
    }
}

impl From<&str> for BinlogValue {
    fn from(value: &str) -> Self {
        BinlogValue::Text(value.to_string())
    }
}

impl From<String> for BinlogValue {
    fn from(value: String) -> Self {
        BinlogValue::Text(value)
    }
}

impl From<f64> for BinlogValue {
    fn from(value: f64) -> Self {
        BinlogValue::Float(value)
    }
}

impl<T> From<Option<T>> for BinlogValue
where
    T: Into<BinlogValue>,
{
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(BinlogValue::Null)
    }
}
