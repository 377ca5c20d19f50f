use config::shared::RedisStructure;
use rhai::Dynamic;
use serde_json::Value;

use crate::bail;
use crate::error::{ErrorKind, EtlResult};
use crate::types::RowAction;

/// Structure code of outputs addressed to document oriented destinations.
pub const DOCUMENT_CODE: u8 = 0;

/// Action prefix of outputs that set a time to live.
const EXPIRE_ACTION: &str = "expire";

/// One destination write produced by a script.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOutput {
    /// String, list or set write (codes 1, 3 and 4).
    Write {
        action: RowAction,
        structure: RedisStructure,
        key: String,
        value: String,
    },
    /// Hash field write (code 2).
    HashWrite {
        action: RowAction,
        key: String,
        field: String,
        value: String,
    },
    /// Sorted set member write (code 5).
    SortedSetWrite {
        action: RowAction,
        key: String,
        score: f64,
        value: String,
    },
    /// Keyed document for search indices, brokers and HTTP (code 0).
    Document {
        action: RowAction,
        key: String,
        value: Value,
    },
    /// Time to live in seconds applied to a key.
    Expire { key: String, seconds: i64 },
}

impl ScriptOutput {
    pub fn key(&self) -> &str {
        match self {
            ScriptOutput::Write { key, .. }
            | ScriptOutput::HashWrite { key, .. }
            | ScriptOutput::SortedSetWrite { key, .. }
            | ScriptOutput::Document { key, .. }
            | ScriptOutput::Expire { key, .. } => key,
        }
    }
}

/// Splits a result key into action, structure code and remainder.
///
/// The slicing is positional: the action is bytes `0..6`, the code byte `7` and the key starts
/// at byte `9`. Separators are not inspected.
pub fn split_result_key(key: &str) -> EtlResult<(&str, &str, &str)> {
    let (Some(action), Some(code)) = (key.get(0..6), key.get(7..8)) else {
        bail!(
            ErrorKind::ScriptRuntimeError,
            "Malformed script result key",
            format!("The key '{key}' does not follow the action_code_key layout")
        );
    };

    Ok((action, code, key.get(9..).unwrap_or_default()))
}

/// Interprets the value returned by `handle`.
///
/// A unit result means the script chose to produce nothing for the row. Expiries come after
/// every write, since writing a string key clears its time to live.
pub fn parse_result(result: Dynamic) -> EtlResult<Vec<ScriptOutput>> {
    if result.is_unit() {
        return Ok(Vec::new());
    }

    let type_name = result.type_name();
    let Some(map) = result.try_cast::<rhai::Map>() else {
        bail!(
            ErrorKind::ScriptRuntimeError,
            "Script returned an unexpected value",
            format!("`handle` must return a map, got {type_name}")
        );
    };

    let outputs = map
        .into_iter()
        .map(|(key, value)| parse_output(key.as_str(), value))
        .collect::<EtlResult<Vec<_>>>()?;
    let (mut writes, expiries): (Vec<_>, Vec<_>) = outputs
        .into_iter()
        .partition(|output| !matches!(output, ScriptOutput::Expire { .. }));
    writes.extend(expiries);

    Ok(writes)
}

fn parse_output(result_key: &str, value: Dynamic) -> EtlResult<ScriptOutput> {
    let (action, code, remainder) = split_result_key(result_key)?;

    let fields = value.clone().try_cast::<rhai::Map>();
    let field = |name: &str| fields.as_ref().and_then(|fields| fields.get(name)).cloned();
    let key = match field("key") {
        Some(key) => render_dynamic(&key)?,
        None => remainder.to_string(),
    };
    let payload = match (&fields, field("value")) {
        (Some(_), Some(payload)) => payload,
        (Some(_), None) if code != "0" => {
            bail!(
                ErrorKind::ScriptRuntimeError,
                "Script result is missing a value",
                format!("The entry '{result_key}' has no `value` field")
            );
        }
        _ => value,
    };

    if action == EXPIRE_ACTION {
        return Ok(ScriptOutput::Expire {
            key,
            seconds: dynamic_to_f64(&payload, result_key)? as i64,
        });
    }

    let action = action.parse::<RowAction>().map_err(|_| {
        crate::etl_error!(
            ErrorKind::ScriptRuntimeError,
            "Unknown action in script result key",
            format!("The entry '{result_key}' starts with '{action}'")
        )
    })?;
    let code = code.parse::<u8>().map_err(|_| {
        crate::etl_error!(
            ErrorKind::ScriptRuntimeError,
            "Invalid structure code in script result key",
            format!("The entry '{result_key}' has code '{code}'")
        )
    })?;

    if code == DOCUMENT_CODE {
        return Ok(ScriptOutput::Document {
            action,
            key,
            value: rhai::serde::from_dynamic::<Value>(&payload)?,
        });
    }

    match RedisStructure::from_code(code) {
        Some(RedisStructure::Hash) => {
            let Some(hash_field) = field("field") else {
                bail!(
                    ErrorKind::ScriptRuntimeError,
                    "Hash result is missing a field",
                    format!("The entry '{result_key}' must be a map with `field` and `value`")
                );
            };

            Ok(ScriptOutput::HashWrite {
                action,
                key,
                field: render_dynamic(&hash_field)?,
                value: render_dynamic(&payload)?,
            })
        }
        Some(RedisStructure::SortedSet) => {
            let score = match field("score") {
                Some(score) => dynamic_to_f64(&score, result_key)?,
                None if action == RowAction::Delete => 0.0,
                None => bail!(
                    ErrorKind::ScriptRuntimeError,
                    "Sorted set result is missing a score",
                    format!("The entry '{result_key}' must be a map with `score` and `value`")
                ),
            };

            Ok(ScriptOutput::SortedSetWrite {
                action,
                key,
                score,
                value: render_dynamic(&payload)?,
            })
        }
        Some(structure) => Ok(ScriptOutput::Write {
            action,
            structure,
            key,
            value: render_dynamic(&payload)?,
        }),
        None => bail!(
            ErrorKind::ScriptRuntimeError,
            "Invalid structure code in script result key",
            format!("The entry '{result_key}' has code {code}")
        ),
    }
}

/// Renders a script value as a destination string. Strings are used verbatim, other values
/// are serialized to JSON.
fn render_dynamic(value: &Dynamic) -> EtlResult<String> {
    if value.is_unit() {
        return Ok(String::new());
    }
    if value.is_string() {
        return Ok(value.to_string());
    }

    let value = rhai::serde::from_dynamic::<Value>(value)?;
    Ok(serde_json::to_string(&value)?)
}

fn dynamic_to_f64(value: &Dynamic, result_key: &str) -> EtlResult<f64> {
    if let Ok(value) = value.as_float() {
        return Ok(value);
    }
    if let Ok(value) = value.as_int() {
        return Ok(value as f64);
    }
    if value.is_string()
        && let Ok(value) = value.to_string().trim().parse::<f64>()
    {
        return Ok(value);
    }

    bail!(
        ErrorKind::ScriptRuntimeError,
        "Script result value is not numeric",
        format!("The entry '{result_key}' needs a number, got {}", value.type_name())
    );
}

#[cfg(test)]
mod tests {
    use rhai::Engine;
    use serde_json::json;

    use super::*;

    fn eval(script: &str) -> Dynamic {
        Engine::new().eval::<Dynamic>(script).unwrap()
    }

    #[test]
    fn key_slicing_is_positional() {
        assert_eq!(
            split_result_key("insert_1_user:42").unwrap(),
            ("insert", "1", "user:42")
        );
        assert_eq!(split_result_key("delete_3_").unwrap(), ("delete", "3", ""));
        assert_eq!(split_result_key("update_2").unwrap(), ("update", "2", ""));
        assert!(split_result_key("insert").is_err());
    }

    #[test]
    fn string_write_from_plain_entry() {
        let outputs = parse_result(eval(r#"#{ "insert_1_foo": "v" }"#)).unwrap();

        assert_eq!(
            outputs,
            vec![ScriptOutput::Write {
                action: RowAction::Insert,
                structure: RedisStructure::String,
                key: "foo".to_string(),
                value: "v".to_string(),
            }]
        );
    }

    #[test]
    fn hash_and_sorted_set_use_nested_maps() {
        let outputs = parse_result(eval(
            r#"#{
                "update_2_a": #{ key: "users", field: "5", value: #{ name: "x" } },
                "insert_5_b": #{ key: "rank", score: 7, value: "5" }
            }"#,
        ))
        .unwrap();

        assert_eq!(
            outputs,
            vec![
                ScriptOutput::SortedSetWrite {
                    action: RowAction::Insert,
                    key: "rank".to_string(),
                    score: 7.0,
                    value: "5".to_string(),
                },
                ScriptOutput::HashWrite {
                    action: RowAction::Update,
                    key: "users".to_string(),
                    field: "5".to_string(),
                    value: r#"{"name":"x"}"#.to_string(),
                },
            ]
        );
    }

    #[test]
    fn expiries_follow_every_write() {
        let outputs = parse_result(eval(
            r#"#{ "insert_0_5": #{ id: 5 }, "expire_1_user:5": 60, "insert_1_user:5": "v" }"#,
        ))
        .unwrap();

        assert_eq!(
            outputs,
            vec![
                ScriptOutput::Document {
                    action: RowAction::Insert,
                    key: "5".to_string(),
                    value: json!({"id": 5}),
                },
                ScriptOutput::Write {
                    action: RowAction::Insert,
                    structure: RedisStructure::String,
                    key: "user:5".to_string(),
                    value: "v".to_string(),
                },
                ScriptOutput::Expire {
                    key: "user:5".to_string(),
                    seconds: 60,
                },
            ]
        );
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert!(parse_result(eval(r#"#{ "upsert_1_k": "v" }"#)).is_err());
        assert!(parse_result(eval(r#"#{ "insert_9_k": "v" }"#)).is_err());
        assert!(parse_result(eval(r#"#{ "insert_2_k": "v" }"#)).is_err());
        assert!(parse_result(eval("42")).is_err());
    }

    #[test]
    fn unit_result_produces_nothing() {
        assert!(parse_result(Dynamic::UNIT).unwrap().is_empty());
    }
}
