use std::borrow::Cow;
use std::fmt::Write;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use mysql::types::{BinlogValue, ColumnSchema, ColumnType};
use serde_json::{Number, Value};
use tracing::warn;

use crate::bail;
use crate::error::{ErrorKind, EtlResult};

/// Layouts accepted for datetime and timestamp text.
const DATETIME_INPUT_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Layout of date text as emitted by the server.
const DATE_INPUT_FORMAT: &str = "%Y-%m-%d";

/// Mediumint values of unsigned columns arrive sign-extended from 24 bits.
const MEDIUMINT_RANGE: i64 = 1 << 24;

/// Output patterns for temporal columns, in `strftime` syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFormats {
    pub datetime: String,
    pub date: String,
}

impl DateFormats {
    /// Builds the formats after checking both patterns parse.
    pub fn new(datetime: impl Into<String>, date: impl Into<String>) -> EtlResult<Self> {
        let formats = Self {
            datetime: datetime.into(),
            date: date.into(),
        };

        for pattern in [&formats.datetime, &formats.date] {
            if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
                bail!(
                    ErrorKind::ConfigError,
                    "Invalid date format",
                    format!("The pattern '{pattern}' is not a valid strftime pattern")
                );
            }
        }

        Ok(formats)
    }
}

impl Default for DateFormats {
    fn default() -> Self {
        Self {
            datetime: "%Y-%m-%d %H:%M:%S".to_string(),
            date: "%Y-%m-%d".to_string(),
        }
    }
}

/// Normalizes a raw binlog value according to its column.
///
/// The function is total: malformed input degrades to [`Value::Null`], with a warning for
/// malformed numbers, labels and JSON. Zero and invalid dates are `null` without a warning.
pub fn convert_column_data(
    raw: &BinlogValue,
    column: &ColumnSchema,
    formats: &DateFormats,
) -> Value {
    if raw.is_null() {
        return Value::Null;
    }

    match column.typ {
        ColumnType::Enum => convert_enum(raw, column),
        ColumnType::Set => convert_set(raw, column),
        ColumnType::Bit => convert_bit(raw),
        ColumnType::Json => convert_json(raw, column),
        ColumnType::Date => convert_date(raw, &formats.date),
        ColumnType::Datetime | ColumnType::Timestamp => convert_datetime(raw, &formats.datetime),
        ColumnType::Number => convert_integer(raw, column),
        ColumnType::MediumInt => match raw {
            BinlogValue::Signed(value) if column.unsigned && *value < 0 => {
                Value::from(value + MEDIUMINT_RANGE)
            }
            _ => convert_integer(raw, column),
        },
        ColumnType::Float | ColumnType::Decimal => convert_float(raw, column),
        ColumnType::String | ColumnType::Time => convert_text(raw),
        ColumnType::Binary | ColumnType::Point => convert_bytes(raw),
    }
}

fn convert_enum(raw: &BinlogValue, column: &ColumnSchema) -> Value {
    let index = match raw {
        BinlogValue::Signed(value) => *value,
        BinlogValue::Unsigned(value) => i64::try_from(*value).unwrap_or(i64::MAX),
        BinlogValue::Text(label) => return Value::String(label.clone()),
        _ => return convert_text(raw),
    };

    // Index zero is the empty string the server stores for invalid enum input.
    if index == 0 {
        return Value::String(String::new());
    }

    match index
        .checked_sub(1)
        .and_then(|position| usize::try_from(position).ok())
        .and_then(|position| column.enum_values.get(position))
    {
        Some(label) => Value::String(label.clone()),
        None => {
            warn!(
                column = %column.name,
                index,
                "enum index out of range, using null"
            );
            Value::Null
        }
    }
}

fn convert_set(raw: &BinlogValue, column: &ColumnSchema) -> Value {
    let mask = match raw {
        BinlogValue::Signed(value) => *value as u64,
        BinlogValue::Unsigned(value) => *value,
        BinlogValue::Text(labels) => return Value::String(labels.clone()),
        _ => return convert_text(raw),
    };

    let labels = column
        .set_values
        .iter()
        .enumerate()
        .filter(|(bit, _)| *bit < 64 && mask & (1u64 << bit) != 0)
        .map(|(_, label)| label.as_str())
        .collect::<Vec<_>>();

    Value::String(labels.join(","))
}

fn convert_bit(raw: &BinlogValue) -> Value {
    let set = match raw {
        BinlogValue::Signed(value) => *value != 0,
        BinlogValue::Unsigned(value) => *value != 0,
        BinlogValue::Float(value) => *value != 0.0,
        BinlogValue::Bytes(bytes) => bytes.iter().any(|byte| *byte != 0),
        BinlogValue::Text(text) => text.bytes().any(|byte| byte != 0 && byte != b'0'),
        BinlogValue::Null => return Value::Null,
    };

    Value::from(u8::from(set))
}

fn convert_json(raw: &BinlogValue, column: &ColumnSchema) -> Value {
    let Some(text) = text_of(raw) else {
        return Value::Null;
    };
    if text.is_empty() {
        return Value::Null;
    }

    match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(err) => {
            warn!(column = %column.name, error = %err, "malformed json value, using null");
            Value::Null
        }
    }
}

fn convert_date(raw: &BinlogValue, pattern: &str) -> Value {
    let Some(text) = text_of(raw) else {
        return Value::Null;
    };

    let date = NaiveDate::parse_from_str(text.trim(), DATE_INPUT_FORMAT).or_else(|_| {
        NaiveDateTime::parse_from_str(text.trim(), DATETIME_INPUT_FORMATS[0])
            .map(|datetime| datetime.date())
    });

    match date {
        Ok(date) => format_temporal(date.format(pattern)),
        Err(_) => Value::Null,
    }
}

fn convert_datetime(raw: &BinlogValue, pattern: &str) -> Value {
    let datetime = match raw {
        BinlogValue::Signed(seconds) => {
            DateTime::from_timestamp(*seconds, 0).map(|datetime| datetime.naive_utc())
        }
        BinlogValue::Unsigned(seconds) => i64::try_from(*seconds)
            .ok()
            .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
            .map(|datetime| datetime.naive_utc()),
        _ => text_of(raw).and_then(|text| {
            DATETIME_INPUT_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(text.trim(), format).ok())
        }),
    };

    match datetime {
        Some(datetime) => format_temporal(datetime.format(pattern)),
        None => Value::Null,
    }
}

fn format_temporal(formatted: impl std::fmt::Display) -> Value {
    let mut out = String::new();
    match write!(out, "{formatted}") {
        Ok(()) => Value::String(out),
        Err(_) => Value::Null,
    }
}

fn convert_integer(raw: &BinlogValue, column: &ColumnSchema) -> Value {
    match raw {
        BinlogValue::Signed(value) => Value::from(*value),
        BinlogValue::Unsigned(value) => Value::from(*value),
        BinlogValue::Float(value) => float_value(*value),
        _ => {
            let Some(text) = text_of(raw) else {
                return Value::Null;
            };
            parse_number(&text).unwrap_or_else(|| {
                warn!(column = %column.name, value = %text, "malformed integer, using null");
                Value::Null
            })
        }
    }
}

fn convert_float(raw: &BinlogValue, column: &ColumnSchema) -> Value {
    match raw {
        BinlogValue::Float(value) => float_value(*value),
        BinlogValue::Signed(value) => Value::from(*value),
        BinlogValue::Unsigned(value) => Value::from(*value),
        _ => {
            let Some(text) = text_of(raw) else {
                return Value::Null;
            };
            match text.trim().parse::<f64>() {
                Ok(value) => float_value(value),
                Err(_) => {
                    warn!(column = %column.name, value = %text, "malformed number, using null");
                    Value::Null
                }
            }
        }
    }
}

fn parse_number(text: &str) -> Option<Value> {
    let text = text.trim();
    if let Ok(value) = text.parse::<i64>() {
        return Some(Value::from(value));
    }
    if let Ok(value) = text.parse::<u64>() {
        return Some(Value::from(value));
    }
    text.parse::<f64>()
        .ok()
        .and_then(|value| Number::from_f64(value).map(Value::Number))
}

fn float_value(value: f64) -> Value {
    Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn convert_text(raw: &BinlogValue) -> Value {
    match raw {
        BinlogValue::Text(text) => Value::String(text.clone()),
        BinlogValue::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => Value::String(STANDARD.encode(bytes)),
        },
        BinlogValue::Signed(value) => Value::String(value.to_string()),
        BinlogValue::Unsigned(value) => Value::String(value.to_string()),
        BinlogValue::Float(value) => Value::String(value.to_string()),
        BinlogValue::Null => Value::Null,
    }
}

fn convert_bytes(raw: &BinlogValue) -> Value {
    convert_text(raw)
}

fn text_of(raw: &BinlogValue) -> Option<Cow<'_, str>> {
    match raw {
        BinlogValue::Text(text) => Some(Cow::Borrowed(text.as_str())),
        BinlogValue::Bytes(bytes) => Some(String::from_utf8_lossy(bytes)),
        BinlogValue::Signed(value) => Some(Cow::Owned(value.to_string())),
        BinlogValue::Unsigned(value) => Some(Cow::Owned(value.to_string())),
        BinlogValue::Float(value) => Some(Cow::Owned(value.to_string())),
        BinlogValue::Null => None,
    }
}
