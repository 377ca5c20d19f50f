use std::fmt;
use std::sync::Arc;

use rhai::{AST, CallFnOptions, Dynamic, Engine, Scope};

use crate::bail;
use crate::error::{ErrorKind, EtlResult};
use crate::rule::RowMap;
use crate::script::output::{ScriptOutput, parse_result};
use crate::types::RowAction;

/// Name of the function every script must define.
const ENTRY_POINT: &str = "handle";

/// Immutable arguments of one script call.
#[derive(Debug, Clone, Copy)]
pub struct ScriptInput<'a> {
    pub action: RowAction,
    pub row: &'a RowMap,
    /// Before-image, present for updates of rules that retain previous rows.
    pub previous: Option<&'a RowMap>,
}

/// A script compiled once per rule and shared by every session created from it.
#[derive(Clone)]
pub struct CompiledScript {
    engine: Arc<Engine>,
    ast: Arc<AST>,
}

impl CompiledScript {
    /// Compiles `source` and checks that it defines `fn handle(event)`.
    pub fn compile(engine: Arc<Engine>, source: &str) -> EtlResult<Self> {
        let ast = engine.compile(source)?;

        let has_entry_point = ast
            .iter_functions()
            .any(|function| function.name == ENTRY_POINT && function.params.len() == 1);
        if !has_entry_point {
            bail!(
                ErrorKind::ScriptCompileError,
                "Script has no entry point",
                "The script must define `fn handle(event)`"
            );
        }

        Ok(Self {
            engine,
            ast: Arc::new(ast),
        })
    }

    /// Creates an interpreter with its own scope.
    pub fn session(&self) -> ScriptSession {
        ScriptSession {
            engine: self.engine.clone(),
            ast: self.ast.clone(),
            scope: Scope::new(),
            calls: 0,
        }
    }
}

impl fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledScript").finish_non_exhaustive()
    }
}

/// One interpreter instance. A session is owned by a single task at a time.
pub struct ScriptSession {
    engine: Arc<Engine>,
    ast: Arc<AST>,
    scope: Scope<'static>,
    calls: u64,
}

impl ScriptSession {
    /// Runs `handle` for one row and returns the writes it requested.
    pub fn call(&mut self, input: &ScriptInput<'_>) -> EtlResult<Vec<ScriptOutput>> {
        let mut event = rhai::Map::new();
        event.insert("Row".into(), rhai::serde::to_dynamic(input.row)?);
        if let Some(previous) = input.previous {
            event.insert("PreRow".into(), rhai::serde::to_dynamic(previous)?);
        }
        event.insert("Action".into(), input.action.as_str().into());

        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let result = self.engine.call_fn_with_options::<Dynamic>(
            options,
            &mut self.scope,
            &self.ast,
            ENTRY_POINT,
            (event,),
        )?;
        self.calls += 1;

        parse_result(result)
    }

    /// Number of successful calls made through this session.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl fmt::Debug for ScriptSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptSession")
            .field("calls", &self.calls)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use config::shared::RedisStructure;
    use serde_json::json;

    use super::*;
    use crate::script::new_engine;

    fn compile(source: &str) -> EtlResult<CompiledScript> {
        CompiledScript::compile(Arc::new(new_engine()), source)
    }

    fn row(value: serde_json::Value) -> RowMap {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn scripts_without_handle_are_rejected() {
        let err = compile("fn other(event) { 1 }").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScriptCompileError);

        let err = compile("fn handle(event) {").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScriptCompileError);
    }

    #[test]
    fn handle_sees_row_previous_row_and_action() {
        let script = compile(
            r#"
            fn handle(event) {
                let result = #{};
                let key = "user:" + event.Row.id;
                if event.Action == "update" {
                    result["delete_3_" + key] = event.PreRow.name;
                }
                result["insert_3_" + key] = event.Row.name;
                result
            }
            "#,
        )
        .unwrap();
        let mut session = script.session();

        let current = row(json!({"id": 5, "name": "b"}));
        let previous = row(json!({"id": 5, "name": "a"}));
        let outputs = session
            .call(&ScriptInput {
                action: RowAction::Update,
                row: &current,
                previous: Some(&previous),
            })
            .unwrap();

        assert_eq!(
            outputs,
            vec![
                ScriptOutput::Write {
                    action: RowAction::Delete,
                    structure: RedisStructure::List,
                    key: "user:5".to_string(),
                    value: "a".to_string(),
                },
                ScriptOutput::Write {
                    action: RowAction::Insert,
                    structure: RedisStructure::List,
                    key: "user:5".to_string(),
                    value: "b".to_string(),
                },
            ]
        );
        assert_eq!(session.calls(), 1);
    }

    #[test]
    fn runtime_errors_surface_as_script_errors() {
        let script = compile(r#"fn handle(event) { throw "boom"; }"#).unwrap();
        let current = row(json!({"id": 1}));

        let err = script
            .session()
            .call(&ScriptInput {
                action: RowAction::Insert,
                row: &current,
                previous: None,
            })
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ScriptRuntimeError);
    }
}
