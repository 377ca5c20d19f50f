use etl::bail;
use etl::error::{ErrorKind, EtlResult};
use etl::rule::RuleContext;
use etl::types::RowAction;
use serde_json::{Value, json};

use crate::encoding::Document;

/// Index of a rule: the configured one, or the lower-cased table name.
pub fn index_name(context: &RuleContext) -> String {
    match &context.rule().index {
        Some(index) => index.clone(),
        None => context.table_name().name.to_lowercase(),
    }
}

/// Renders documents as a `_bulk` request body.
///
/// Inserts and updates become `index` operations so a replayed row overwrites its document.
/// Deletes carry no source line.
pub fn bulk_body<'a>(
    items: impl IntoIterator<Item = (&'a str, &'a Document)>,
) -> EtlResult<String> {
    let mut body = String::new();

    for (index, document) in items {
        match document.action {
            RowAction::Insert | RowAction::Update => {
                let action = json!({ "index": { "_index": index, "_id": document.id } });
                body.push_str(&serde_json::to_string(&action)?);
                body.push('\n');
                body.push_str(&serde_json::to_string(&document.body)?);
                body.push('\n');
            }
            RowAction::Delete => {
                let action = json!({ "delete": { "_index": index, "_id": document.id } });
                body.push_str(&serde_json::to_string(&action)?);
                body.push('\n');
            }
        }
    }

    Ok(body)
}

/// Fails when any item of a `_bulk` response failed. Deleting a missing document is not a
/// failure.
pub fn check_bulk_response(body: &str) -> EtlResult<()> {
    let response: Value = serde_json::from_str(body)?;
    if response.get("errors").and_then(Value::as_bool) != Some(true) {
        return Ok(());
    }

    let items = response
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut failures = Vec::new();
    for item in items {
        let Some((operation, result)) = item.as_object().and_then(|item| item.iter().next())
        else {
            continue;
        };

        let status = result.get("status").and_then(Value::as_u64).unwrap_or_default();
        if status < 300 || (operation == "delete" && status == 404) {
            continue;
        }

        let reason = result
            .get("error")
            .and_then(|error| error.get("reason"))
            .and_then(Value::as_str)
            .unwrap_or("unknown reason");
        let id = result.get("_id").and_then(Value::as_str).unwrap_or_default();
        failures.push(format!("{operation} {id} ({status}): {reason}"));
    }

    if failures.is_empty() {
        return Ok(());
    }

    bail!(
        ErrorKind::DestinationQueryFailed,
        "Elasticsearch rejected bulk items",
        failures.join("; ")
    );
}
