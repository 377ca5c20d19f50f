use std::fmt;

use config::shared::{RedisRuleConfig, RedisStructure};
use etl::bail;
use etl::conversions::render_plain;
use etl::error::{ErrorKind, EtlResult};
use etl::rule::RuleContext;
use etl::script::{ScriptOutput, ScriptSession};
use etl::types::{RowAction, RowEventRequest};
use serde_json::Value;

/// One Redis write, in the order it must be applied.
#[derive(Debug, Clone, PartialEq)]
pub enum RedisCommand {
    Set { key: String, value: String },
    Del { key: String },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
    RPush { key: String, value: String },
    /// Removes every occurrence of `value`.
    LRem { key: String, value: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    ZAdd { key: String, score: f64, member: String },
    ZRem { key: String, member: String },
    Expire { key: String, seconds: i64 },
}

impl RedisCommand {
    /// Size of the key and payload, used for egress accounting.
    pub fn payload_len(&self) -> usize {
        match self {
            RedisCommand::Set { key, value }
            | RedisCommand::RPush { key, value }
            | RedisCommand::LRem { key, value } => key.len() + value.len(),
            RedisCommand::HSet { key, field, value } => key.len() + field.len() + value.len(),
            RedisCommand::HDel { key, field } => key.len() + field.len(),
            RedisCommand::SAdd { key, member }
            | RedisCommand::SRem { key, member }
            | RedisCommand::ZAdd { key, member, .. }
            | RedisCommand::ZRem { key, member } => key.len() + member.len(),
            RedisCommand::Del { key } | RedisCommand::Expire { key, .. } => key.len(),
        }
    }
}

impl fmt::Display for RedisCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedisCommand::Set { key, value } => write!(f, "SET {key} {value}"),
            RedisCommand::Del { key } => write!(f, "DEL {key}"),
            RedisCommand::HSet { key, field, value } => write!(f, "HSET {key} {field} {value}"),
            RedisCommand::HDel { key, field } => write!(f, "HDEL {key} {field}"),
            RedisCommand::RPush { key, value } => write!(f, "RPUSH {key} {value}"),
            RedisCommand::LRem { key, value } => write!(f, "LREM {key} 0 {value}"),
            RedisCommand::SAdd { key, member } => write!(f, "SADD {key} {member}"),
            RedisCommand::SRem { key, member } => write!(f, "SREM {key} {member}"),
            RedisCommand::ZAdd { key, score, member } => write!(f, "ZADD {key} {score} {member}"),
            RedisCommand::ZRem { key, member } => write!(f, "ZREM {key} {member}"),
            RedisCommand::Expire { key, seconds } => write!(f, "EXPIRE {key} {seconds}"),
        }
    }
}

/// Builds the commands for one row.
///
/// Script rules map their outputs one to one. Declarative rules derive keys and values from the
/// rule's Redis settings. Updates of lists, sets and sorted sets remove the previous
/// representation before adding the new one, which needs the retained before-image.
pub fn build_commands(
    context: &RuleContext,
    request: &RowEventRequest,
    session: Option<&mut ScriptSession>,
) -> EtlResult<Vec<RedisCommand>> {
    if context.is_script() {
        return context
            .run_script(request, session)?
            .into_iter()
            .map(script_command)
            .collect();
    }

    let default_settings = RedisRuleConfig::default();
    let settings = context.rule().redis.as_ref().unwrap_or(&default_settings);
    let previous = previous_request(request);

    match settings.structure {
        RedisStructure::String => {
            let key = string_key(context, settings, request)?;
            match request.action {
                RowAction::Delete => Ok(vec![RedisCommand::Del { key }]),
                RowAction::Insert => Ok(vec![RedisCommand::Set {
                    key,
                    value: context.encode(request)?,
                }]),
                RowAction::Update => {
                    let mut commands = Vec::with_capacity(2);
                    if let Some(previous) = &previous {
                        let previous_key = string_key(context, settings, previous)?;
                        if previous_key != key {
                            commands.push(RedisCommand::Del { key: previous_key });
                        }
                    }
                    commands.push(RedisCommand::Set {
                        key,
                        value: context.encode(request)?,
                    });

                    Ok(commands)
                }
            }
        }
        RedisStructure::Hash => {
            let key = collection_key(context, settings, request)?;
            let field = hash_field(context, settings, request)?;
            match request.action {
                RowAction::Delete => Ok(vec![RedisCommand::HDel { key, field }]),
                RowAction::Insert => Ok(vec![RedisCommand::HSet {
                    key,
                    field,
                    value: context.encode(request)?,
                }]),
                RowAction::Update => {
                    let mut commands = Vec::with_capacity(2);
                    if let Some(previous) = &previous {
                        let previous_field = hash_field(context, settings, previous)?;
                        if previous_field != field {
                            commands.push(RedisCommand::HDel {
                                key: key.clone(),
                                field: previous_field,
                            });
                        }
                    }
                    commands.push(RedisCommand::HSet {
                        key,
                        field,
                        value: context.encode(request)?,
                    });

                    Ok(commands)
                }
            }
        }
        RedisStructure::List => {
            let key = collection_key(context, settings, request)?;
            let value = context.encode(request)?;
            match request.action {
                RowAction::Insert => Ok(vec![RedisCommand::RPush { key, value }]),
                RowAction::Delete => Ok(vec![RedisCommand::LRem { key, value }]),
                RowAction::Update => {
                    let previous = required_previous(context, previous.as_ref())?;
                    Ok(vec![
                        RedisCommand::LRem {
                            key: key.clone(),
                            value: context.encode(previous)?,
                        },
                        RedisCommand::RPush { key, value },
                    ])
                }
            }
        }
        RedisStructure::Set => {
            let key = collection_key(context, settings, request)?;
            let member = context.encode(request)?;
            match request.action {
                RowAction::Insert => Ok(vec![RedisCommand::SAdd { key, member }]),
                RowAction::Delete => Ok(vec![RedisCommand::SRem { key, member }]),
                RowAction::Update => {
                    let previous = required_previous(context, previous.as_ref())?;
                    Ok(vec![
                        RedisCommand::SRem {
                            key: key.clone(),
                            member: context.encode(previous)?,
                        },
                        RedisCommand::SAdd { key, member },
                    ])
                }
            }
        }
        RedisStructure::SortedSet => {
            let key = collection_key(context, settings, request)?;
            let member = context.encode(request)?;
            match request.action {
                RowAction::Delete => Ok(vec![RedisCommand::ZRem { key, member }]),
                RowAction::Insert => Ok(vec![RedisCommand::ZAdd {
                    score: score(context, settings, request)?,
                    key,
                    member,
                }]),
                RowAction::Update => {
                    let previous = required_previous(context, previous.as_ref())?;
                    Ok(vec![
                        RedisCommand::ZRem {
                            key: key.clone(),
                            member: context.encode(previous)?,
                        },
                        RedisCommand::ZAdd {
                            score: score(context, settings, request)?,
                            key,
                            member,
                        },
                    ])
                }
            }
        }
    }
}

fn script_command(output: ScriptOutput) -> EtlResult<RedisCommand> {
    let command = match output {
        ScriptOutput::Write {
            action,
            structure,
            key,
            value,
        } => match (structure, action) {
            (RedisStructure::String, RowAction::Delete) => RedisCommand::Del { key },
            (RedisStructure::String, _) => RedisCommand::Set { key, value },
            (RedisStructure::List, RowAction::Delete) => RedisCommand::LRem { key, value },
            (RedisStructure::List, _) => RedisCommand::RPush { key, value },
            (RedisStructure::Set, RowAction::Delete) => RedisCommand::SRem { key, member: value },
            (RedisStructure::Set, _) => RedisCommand::SAdd { key, member: value },
            (structure, _) => bail!(
                ErrorKind::InvalidData,
                "Unexpected structure in script write",
                format!("The write for key '{key}' uses structure code {}", structure.code())
            ),
        },
        ScriptOutput::HashWrite {
            action: RowAction::Delete,
            key,
            field,
            ..
        } => RedisCommand::HDel { key, field },
        ScriptOutput::HashWrite {
            key, field, value, ..
        } => RedisCommand::HSet { key, field, value },
        ScriptOutput::SortedSetWrite {
            action: RowAction::Delete,
            key,
            value,
            ..
        } => RedisCommand::ZRem { key, member: value },
        ScriptOutput::SortedSetWrite {
            key, score, value, ..
        } => RedisCommand::ZAdd {
            key,
            score,
            member: value,
        },
        ScriptOutput::Document {
            action: RowAction::Delete,
            key,
            ..
        } => RedisCommand::Del { key },
        ScriptOutput::Document { key, value, .. } => RedisCommand::Set {
            key,
            value: match value {
                Value::String(text) => text,
                other => serde_json::to_string(&other)?,
            },
        },
        ScriptOutput::Expire { key, seconds } => RedisCommand::Expire { key, seconds },
    };

    Ok(command)
}

/// Rebuilds the before-image of an update as a request of its own.
fn previous_request(request: &RowEventRequest) -> Option<RowEventRequest> {
    match (request.action, &request.previous) {
        (RowAction::Update, Some(previous)) => Some(RowEventRequest::new(
            request.context.clone(),
            RowAction::Update,
            request.timestamp,
            previous.clone(),
        )),
        _ => None,
    }
}

fn required_previous<'a>(
    context: &RuleContext,
    previous: Option<&'a RowEventRequest>,
) -> EtlResult<&'a RowEventRequest> {
    match previous {
        Some(previous) => Ok(previous),
        None => bail!(
            ErrorKind::EncodingError,
            "Missing previous row",
            format!(
                "Updates of {} need the previous row, enable `retain_previous_row`",
                context.table_name()
            )
        ),
    }
}

/// Key of a string entry: the key template, the Redis key column or the row key.
fn string_key(
    context: &RuleContext,
    settings: &RedisRuleConfig,
    request: &RowEventRequest,
) -> EtlResult<String> {
    let key = match context.render_key_template(request) {
        Some(rendered) => rendered?,
        None => match &settings.key_column {
            Some(column) => column_text(context, request, column)?,
            None => context.document_key(request)?,
        },
    };

    Ok(format!("{}{key}", settings.key_prefix))
}

/// Key of a hash, list, set or sorted set: the fixed key, the key template or the table name.
fn collection_key(
    context: &RuleContext,
    settings: &RedisRuleConfig,
    request: &RowEventRequest,
) -> EtlResult<String> {
    if let Some(fixed_key) = &settings.fixed_key {
        return Ok(fixed_key.clone());
    }

    let key = match context.render_key_template(request) {
        Some(rendered) => rendered?,
        None => context.table_name().name.clone(),
    };

    Ok(format!("{}{key}", settings.key_prefix))
}

fn hash_field(
    context: &RuleContext,
    settings: &RedisRuleConfig,
    request: &RowEventRequest,
) -> EtlResult<String> {
    let field = match settings
        .hash_field_column
        .as_ref()
        .or(settings.key_column.as_ref())
    {
        Some(column) => column_text(context, request, column)?,
        None => context.document_key(request)?,
    };

    Ok(format!("{}{field}", settings.hash_field_prefix))
}

fn score(
    context: &RuleContext,
    settings: &RedisRuleConfig,
    request: &RowEventRequest,
) -> EtlResult<f64> {
    let Some(column) = &settings.score_column else {
        bail!(
            ErrorKind::EncodingError,
            "Missing score column",
            format!("The sorted set rule for {} has no score column", context.table_name())
        );
    };

    let score = match context.column_value(&request.values, column) {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    };

    match score {
        Some(score) => Ok(score),
        None => bail!(
            ErrorKind::EncodingError,
            "Invalid score value",
            format!("The column '{column}' of {} is not numeric", context.table_name())
        ),
    }
}

fn column_text(
    context: &RuleContext,
    request: &RowEventRequest,
    column: &str,
) -> EtlResult<String> {
    match context.column_value(&request.values, column) {
        Some(value) if !value.is_null() => Ok(render_plain(&value)),
        _ => bail!(
            ErrorKind::EncodingError,
            "Missing key value",
            format!("The column '{column}' of {} is null or absent", context.table_name())
        ),
    }
}
