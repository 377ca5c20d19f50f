use config::shared::{ColumnCase, RuleConfig};

use crate::conversions::to_camel_case;

/// Name under which `column` is emitted by `rule`.
///
/// Explicit mappings are matched case-insensitively and win over the case mode.
pub fn wire_name(column: &str, rule: &RuleConfig) -> String {
    if let Some(mapped) = rule
        .column_mappings
        .iter()
        .find(|(source, _)| source.eq_ignore_ascii_case(column))
        .map(|(_, target)| target)
    {
        return mapped.clone();
    }

    match rule.column_case {
        ColumnCase::Identity => column.to_string(),
        ColumnCase::Upper => column.to_uppercase(),
        ColumnCase::Lower => column.to_lowercase(),
        ColumnCase::Camel => to_camel_case(column),
    }
}
