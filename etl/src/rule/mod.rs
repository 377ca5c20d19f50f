//! Per-table transformation rules compiled against concrete table metadata.

mod context;
mod naming;
mod registry;
mod template;

pub use context::{Padding, RowMap, RuleContext};
pub use naming::wire_name;
pub use registry::{RuleRegistry, rule_key};
pub use template::Template;
