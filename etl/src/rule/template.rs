use std::fmt;

use rhai::{AST, Dynamic, Engine, Scope};

use crate::bail;
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::rule::RowMap;
use crate::types::RowAction;

/// A value template such as `user:${id}`, compiled to an interpolated string expression.
///
/// Columns whose wire name is a valid identifier are bound as variables. The whole row is
/// bound as `row` and the action as `action`.
#[derive(Clone)]
pub struct Template {
    source: String,
    ast: AST,
}

impl Template {
    pub fn compile(engine: &Engine, source: &str) -> EtlResult<Self> {
        if source.contains('`') {
            bail!(
                ErrorKind::ConfigError,
                "Malformed template",
                format!("The template '{source}' must not contain backticks")
            );
        }

        let ast = engine.compile(format!("`{source}`")).map_err(|err| {
            etl_error!(
                ErrorKind::ConfigError,
                "Malformed template",
                format!("The template '{source}' does not compile: {err}")
            )
        })?;

        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the template against `row`. Failures are reported as encoding errors.
    pub fn render(&self, engine: &Engine, row: &RowMap, action: RowAction) -> EtlResult<String> {
        let mut scope = Scope::new();
        for (name, value) in row {
            if is_identifier(name) {
                scope.push_constant_dynamic(name.as_str(), rhai::serde::to_dynamic(value)?);
            }
        }
        scope.push_constant_dynamic("row", rhai::serde::to_dynamic(row)?);
        scope.push_constant("action", action.as_str().to_string());

        let rendered = engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            .map_err(|err| {
                etl_error!(
                    ErrorKind::EncodingError,
                    "Template evaluation failed",
                    format!("The template '{}' failed: {err}", self.source)
                )
            })?;

        Ok(rendered.to_string())
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("source", &self.source)
            .finish()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::script::new_engine;

    fn row() -> RowMap {
        let serde_json::Value::Object(map) = json!({"id": 5, "name": "a", "first name": "b"}) else {
            unreachable!()
        };
        map
    }

    #[test]
    fn renders_columns_row_and_action() {
        let engine = new_engine();
        let template =
            Template::compile(&engine, r#"${action}:user:${id}:${name}:${row["first name"]}"#)
                .unwrap();

        assert_eq!(
            template.render(&engine, &row(), RowAction::Insert).unwrap(),
            "insert:user:5:a:b"
        );
    }

    #[test]
    fn malformed_templates_are_config_errors() {
        let engine = new_engine();

        let err = Template::compile(&engine, "user:${id").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);

        let err = Template::compile(&engine, "a`b").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn unknown_variables_fail_at_render() {
        let engine = new_engine();
        let template = Template::compile(&engine, "${missing}").unwrap();

        let err = template
            .render(&engine, &row(), RowAction::Delete)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EncodingError);
    }
}
