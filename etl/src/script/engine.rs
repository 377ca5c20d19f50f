use rhai::Engine;
use tracing::{debug, info};

/// Upper bound of operations a single script call may execute.
const MAX_OPERATIONS: u64 = 1_000_000;

const MAX_EXPR_DEPTH: usize = 64;

const MAX_FUNCTION_EXPR_DEPTH: usize = 32;

const MAX_CALL_LEVELS: usize = 32;

const MAX_STRING_SIZE: usize = 1 << 20;

const MAX_COLLECTION_SIZE: usize = 10_000;

/// Creates the sandboxed engine shared by every script and template of a pipeline.
///
/// The engine has no file or network access. Resource limits bound runaway scripts, and
/// `print`/`debug` are routed to the log.
pub fn new_engine() -> Engine {
    let mut engine = Engine::new();

    engine
        .set_max_operations(MAX_OPERATIONS)
        .set_max_expr_depths(MAX_EXPR_DEPTH, MAX_FUNCTION_EXPR_DEPTH)
        .set_max_call_levels(MAX_CALL_LEVELS)
        .set_max_string_size(MAX_STRING_SIZE)
        .set_max_array_size(MAX_COLLECTION_SIZE)
        .set_max_map_size(MAX_COLLECTION_SIZE);

    engine.disable_symbol("eval");

    engine.on_print(|text| info!(target: "script", "{text}"));
    engine.on_debug(|text, source, position| {
        debug!(target: "script", source = source.unwrap_or_default(), %position, "{text}")
    });

    engine
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runaway_scripts_are_stopped() {
        let engine = new_engine();
        let result = engine.eval::<i64>("let x = 0; loop { x += 1; }");
        assert!(result.is_err());
    }
}
