use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use config::shared::RuleConfig;
use mysql::types::TableName;
use tracing::debug;

use crate::rule::RuleContext;
use crate::types::PipelineId;

/// Registry key of a table rule: `<pipeline>.<schema>.<table>`, lower-cased.
pub fn rule_key(pipeline_id: PipelineId, schema: &str, table: &str) -> String {
    format!("{pipeline_id}.{schema}.{table}").to_lowercase()
}

#[derive(Debug, Clone)]
struct RuleEntry {
    rule: Arc<RuleConfig>,
    /// Compiled form of `rule`, rebuilt lazily after the table changed.
    context: Option<Arc<RuleContext>>,
}

/// Rules of every running pipeline, shared between the binlog handlers, the exporters and the
/// supervisors.
///
/// Lookups vastly outnumber updates, so entries are guarded by a read-write lock that is never
/// held across an await point.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    inner: Arc<RwLock<HashMap<String, RuleEntry>>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rule without compiling it. An existing entry for the table is replaced.
    pub fn register(&self, pipeline_id: PipelineId, rule: RuleConfig) {
        let key = rule_key(pipeline_id, &rule.schema, &rule.table);
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.insert(
            key,
            RuleEntry {
                rule: Arc::new(rule),
                context: None,
            },
        );
    }

    /// Stores a compiled context, registering its rule when needed.
    pub fn insert(&self, context: Arc<RuleContext>) {
        let table = context.table_name();
        let key = rule_key(context.pipeline_id(), &table.schema, &table.name);
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.insert(
            key,
            RuleEntry {
                rule: Arc::new(context.rule().clone()),
                context: Some(context),
            },
        );
    }

    /// The compiled context of a table, if the table has a rule and it is compiled.
    pub fn get(&self, pipeline_id: PipelineId, table: &TableName) -> Option<Arc<RuleContext>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .get(&rule_key(pipeline_id, &table.schema, &table.name))
            .and_then(|entry| entry.context.clone())
    }

    /// The configured rule of a table, compiled or not.
    pub fn rule(&self, pipeline_id: PipelineId, table: &TableName) -> Option<Arc<RuleConfig>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .get(&rule_key(pipeline_id, &table.schema, &table.name))
            .map(|entry| entry.rule.clone())
    }

    /// Drops the compiled context of a table so the next event rebuilds it from fresh metadata.
    pub fn invalidate(&self, pipeline_id: PipelineId, table: &TableName) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.get_mut(&rule_key(pipeline_id, &table.schema, &table.name)) {
            Some(entry) => {
                debug!(pipeline_id, table = %table, "invalidated rule context");
                entry.context.take().is_some()
            }
            None => false,
        }
    }

    pub fn remove(&self, pipeline_id: PipelineId, table: &TableName) -> Option<Arc<RuleConfig>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .remove(&rule_key(pipeline_id, &table.schema, &table.name))
            .map(|entry| entry.rule)
    }

    /// Removes every rule of a pipeline and returns how many were dropped.
    pub fn remove_pipeline(&self, pipeline_id: PipelineId) -> usize {
        let prefix = format!("{pipeline_id}.");
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = inner.len();
        inner.retain(|key, _| !key.starts_with(&prefix));

        before - inner.len()
    }

    /// Rules of a pipeline, in no particular order.
    pub fn rules_for(&self, pipeline_id: PipelineId) -> Vec<Arc<RuleConfig>> {
        let prefix = format!("{pipeline_id}.");
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, entry)| entry.rule.clone())
            .collect()
    }

    /// Compiled contexts of a pipeline.
    pub fn contexts(&self, pipeline_id: PipelineId) -> Vec<Arc<RuleContext>> {
        let prefix = format!("{pipeline_id}.");
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(_, entry)| entry.context.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use mysql::types::{ColumnSchema, ColumnType, TableSchema};

    use super::*;
    use crate::script::new_engine;

    fn context(pipeline_id: PipelineId, table: &str) -> Arc<RuleContext> {
        let schema = TableSchema::new(
            TableName::new("Shop", table),
            vec![ColumnSchema::new("id", ColumnType::Number).primary()],
        );

        Arc::new(
            RuleContext::build(
                pipeline_id,
                "test",
                Arc::new(RuleConfig::new("Shop", table)),
                Arc::new(schema),
                Arc::new(new_engine()),
                false,
            )
            .unwrap(),
        )
    }

    #[test]
    fn keys_are_case_insensitive() {
        assert_eq!(rule_key(7, "Shop", "Users"), "7.shop.users");

        let registry = RuleRegistry::new();
        registry.insert(context(1, "Users"));

        assert!(registry.get(1, &TableName::new("shop", "USERS")).is_some());
        assert!(registry.get(2, &TableName::new("shop", "users")).is_none());
    }

    #[test]
    fn invalidate_keeps_the_rule() {
        let registry = RuleRegistry::new();
        registry.insert(context(1, "users"));
        let table = TableName::new("shop", "users");

        assert!(registry.invalidate(1, &table));
        assert!(registry.get(1, &table).is_none());
        assert!(registry.rule(1, &table).is_some());
        assert!(!registry.invalidate(1, &table));
    }

    #[test]
    fn remove_pipeline_only_touches_its_rules() {
        let registry = RuleRegistry::new();
        registry.insert(context(1, "users"));
        registry.insert(context(1, "orders"));
        registry.insert(context(11, "users"));
        registry.register(1, RuleConfig::new("shop", "items"));

        assert_eq!(registry.rules_for(1).len(), 3);
        assert_eq!(registry.contexts(1).len(), 2);
        assert_eq!(registry.remove_pipeline(1), 3);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(11, &TableName::new("shop", "users")).is_some());
    }
}
