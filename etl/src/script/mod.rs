//! Embedded scripting for per-row transformation logic.
//!
//! Rules with a script define `fn handle(event)`. The function receives a map with `Row`,
//! `PreRow` (updates only) and `Action`, and returns a map whose keys follow the
//! `action_code_key` convention parsed by [`output`].

mod engine;
mod output;
mod pool;
mod session;

pub use engine::new_engine;
pub use output::{ScriptOutput, parse_result, split_result_key};
pub use pool::InterpreterPool;
pub use session::{CompiledScript, ScriptInput, ScriptSession};
