use std::collections::HashSet;
use std::path::PathBuf;

use serde::Deserialize;

use crate::Config;
use crate::shared::{
    CheckpointStoreConfig, EndpointConfig, PipelineConfig, RuleConfig, ValidationError,
};

/// Complete configuration of the replicator service.
///
/// This intentionally does not implement [`serde::Serialize`] to avoid leaking secrets.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicatorConfig {
    pub pipeline: PipelineConfig,
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub checkpoint_store: CheckpointStoreConfig,
    pub rules: Vec<RuleConfig>,
    /// JSON-lines file of decoded binlog events replayed instead of a live subscription.
    pub replay_file: Option<PathBuf>,
}

impl ReplicatorConfig {
    /// Validates every section and rejects rules that target the same table twice.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.pipeline.validate()?;
        self.endpoint.validate()?;

        let mut seen = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;

            let key = format!("{}.{}", rule.schema, rule.table).to_lowercase();
            if !seen.insert(key.clone()) {
                return Err(ValidationError::DuplicateRule(key));
            }
        }

        Ok(())
    }
}

impl Config for ReplicatorConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["endpoint.addresses"];
}
