//! Row encodings shared by the document, broker and HTTP adapters.
//!
//! Redis has its own command builder since its structures carry more than a key and a body.

use config::shared::ValueEncoding;
use etl::bail;
use etl::conversions::render_plain;
use etl::error::{ErrorKind, EtlResult};
use etl::rule::RuleContext;
use etl::script::{ScriptOutput, ScriptSession};
use etl::types::{RowAction, RowEventRequest};
use serde_json::Value;

/// A keyed document, as written to search indices.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub action: RowAction,
    pub id: String,
    /// `Null` for deletes.
    pub body: Value,
}

/// A message for brokers and HTTP endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub key: Option<String>,
    pub payload: String,
    /// Whether `payload` already is JSON text.
    pub is_json: bool,
}

/// Topic of a rule: the configured one, or `schema.table`.
pub fn topic(context: &RuleContext) -> String {
    match &context.rule().topic {
        Some(topic) => topic.clone(),
        None => format!(
            "{}.{}",
            context.table_name().schema,
            context.table_name().name
        ),
    }
}

/// Turns one request into documents.
///
/// Declarative rules produce one document keyed by the row's key column. An update that moved
/// the key also deletes the document under the old key when the before-image was retained.
/// Script rules must only produce document outputs.
pub fn documents(
    context: &RuleContext,
    request: &RowEventRequest,
    session: Option<&mut ScriptSession>,
) -> EtlResult<Vec<Document>> {
    if context.is_script() {
        return context
            .run_script(request, session)?
            .into_iter()
            .map(script_document)
            .collect();
    }

    let id = context.document_key(request)?;
    let mut documents = Vec::with_capacity(2);

    if let (RowAction::Update, Some(previous), Some(column)) =
        (request.action, &request.previous, context.key_column())
        && let Some(previous_id) = context.column_value(previous, column)
        && !previous_id.is_null()
    {
        let previous_id = render_plain(&previous_id);
        if previous_id != id {
            documents.push(Document {
                action: RowAction::Delete,
                id: previous_id,
                body: Value::Null,
            });
        }
    }

    let body = match request.action {
        RowAction::Delete => Value::Null,
        _ => Value::Object(context.row(request)),
    };
    documents.push(Document {
        action: request.action,
        id,
        body,
    });

    Ok(documents)
}

/// Turns one request into messages.
///
/// Declarative rules produce the encoded message body of the rule, keyed by the row's key
/// column when the rule has one. Script rules produce one message per document output.
pub fn messages(
    context: &RuleContext,
    request: &RowEventRequest,
    session: Option<&mut ScriptSession>,
) -> EtlResult<Vec<Message>> {
    let topic = topic(context);

    if context.is_script() {
        return context
            .run_script(request, session)?
            .into_iter()
            .map(|output| script_message(output, &topic))
            .collect();
    }

    let key = match context.key_column() {
        Some(_) => Some(context.document_key(request)?),
        None => None,
    };

    Ok(vec![Message {
        topic,
        key,
        payload: context.encode_message(request)?,
        is_json: context.rule().encoding == ValueEncoding::Json,
    }])
}

fn script_document(output: ScriptOutput) -> EtlResult<Document> {
    match output {
        ScriptOutput::Document { action, key, value } => Ok(Document {
            action,
            id: key,
            body: value,
        }),
        other => bail!(
            ErrorKind::EncodingError,
            "Script output is not a document",
            format!(
                "Only structure code 0 is accepted here, got an output for key '{}'",
                other.key()
            )
        ),
    }
}

fn script_message(output: ScriptOutput, topic: &str) -> EtlResult<Message> {
    let (key, value) = match output {
        ScriptOutput::Document { key, value, .. } => (key, value),
        other => bail!(
            ErrorKind::EncodingError,
            "Script output is not a message",
            format!(
                "Only structure code 0 is accepted here, got an output for key '{}'",
                other.key()
            )
        ),
    };

    let (payload, is_json) = match value {
        Value::String(text) => (text, false),
        other => (serde_json::to_string(&other)?, true),
    };

    Ok(Message {
        topic: topic.to_string(),
        key: (!key.is_empty()).then_some(key),
        payload,
        is_json,
    })
}

/// Renders messages as one JSON array. Non JSON payloads become JSON strings.
pub fn json_array<'a>(messages: impl IntoIterator<Item = &'a Message>) -> EtlResult<String> {
    let mut body = String::from("[");

    for (index, message) in messages.into_iter().enumerate() {
        if index > 0 {
            body.push(',');
        }
        if message.is_json {
            body.push_str(&message.payload);
        } else {
            body.push_str(&serde_json::to_string(&message.payload)?);
        }
    }
    body.push(']');

    Ok(body)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use config::shared::RuleConfig;
    use etl::script::new_engine;
    use etl::test_utils::schema::{rule_for, users_table_schema};
    use serde_json::json;

    use super::*;

    fn context(rule: RuleConfig) -> Arc<RuleContext> {
        Arc::new(
            RuleContext::build(
                1,
                "test",
                Arc::new(rule),
                Arc::new(users_table_schema()),
                Arc::new(new_engine()),
                true,
            )
            .unwrap(),
        )
    }

    fn insert(context: &Arc<RuleContext>, id: i64, name: &str) -> RowEventRequest {
        RowEventRequest::new(
            context.clone(),
            RowAction::Insert,
            1_700_000_000,
            vec![id.into(), name.into()],
        )
    }

    #[test]
    fn declarative_rows_become_keyed_documents() {
        let context = context(rule_for(&users_table_schema()));

        let documents = documents(&context, &insert(&context, 5, "a"), None).unwrap();

        assert_eq!(
            documents,
            vec![Document {
                action: RowAction::Insert,
                id: "5".to_string(),
                body: json!({"id": 5, "name": "a"}),
            }]
        );
    }

    #[test]
    fn moved_key_deletes_the_old_document() {
        let context = context(rule_for(&users_table_schema()));
        let request = RowEventRequest::new(
            context.clone(),
            RowAction::Update,
            0,
            vec![6i64.into(), "a".into()],
        )
        .with_previous(vec![5i64.into(), "a".into()]);

        let documents = documents(&context, &request, None).unwrap();

        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].action, RowAction::Delete);
        assert_eq!(documents[0].id, "5");
        assert_eq!(documents[1].id, "6");
    }

    #[test]
    fn redis_outputs_are_rejected_by_document_sinks() {
        let mut rule = rule_for(&users_table_schema());
        rule.script = Some(
            r#"fn handle(event) { #{ "insert_1_k": event.Row.name } }"#.to_string(),
        );
        let context = context(rule);

        let err = documents(&context, &insert(&context, 1, "a"), None).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::EncodingError);
    }

    #[test]
    fn json_messages_carry_the_envelope() {
        let mut rule = rule_for(&users_table_schema());
        rule.topic = Some("users".to_string());
        let context = context(rule);

        let messages = messages(&context, &insert(&context, 5, "a"), None).unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "users");
        assert_eq!(messages[0].key.as_deref(), Some("5"));
        let envelope: Value = serde_json::from_str(&messages[0].payload).unwrap();
        assert_eq!(envelope["action"], "insert");
        assert_eq!(envelope["table"], "users");
        assert_eq!(envelope["data"], json!({"id": 5, "name": "a"}));
    }

    #[test]
    fn plain_payloads_are_quoted_in_arrays() {
        let mut rule = rule_for(&users_table_schema());
        rule.encoding = ValueEncoding::VCommas;
        let context = context(rule);

        let messages = messages(&context, &insert(&context, 5, "a"), None).unwrap();
        assert_eq!(messages[0].topic, "shop.users");

        let body = json_array(&messages).unwrap();
        assert_eq!(body, r#"["5,a"]"#);
    }
}
