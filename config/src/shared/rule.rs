use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// How column names are rewritten before reaching the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnCase {
    #[default]
    Identity,
    Upper,
    Lower,
    /// `user_name` becomes `userName`.
    Camel,
}

/// How a row is rendered into a single string by message and HTTP sinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueEncoding {
    /// A JSON object.
    #[default]
    Json,
    /// `id=1,name=a`.
    KvCommas,
    /// `1,a`.
    VCommas,
    /// [`RuleConfig::template`] evaluated against the row.
    Template,
}

/// Redis data structure a rule writes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedisStructure {
    #[default]
    String,
    Hash,
    List,
    Set,
    SortedSet,
}

impl RedisStructure {
    /// Numeric code used by scripts in result keys.
    pub fn code(&self) -> u8 {
        match self {
            RedisStructure::String => 1,
            RedisStructure::Hash => 2,
            RedisStructure::List => 3,
            RedisStructure::Set => 4,
            RedisStructure::SortedSet => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(RedisStructure::String),
            2 => Some(RedisStructure::Hash),
            3 => Some(RedisStructure::List),
            4 => Some(RedisStructure::Set),
            5 => Some(RedisStructure::SortedSet),
            _ => None,
        }
    }
}

/// Redis specific part of a rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RedisRuleConfig {
    #[serde(default)]
    pub structure: RedisStructure,
    /// Prepended to every generated key.
    #[serde(default)]
    pub key_prefix: String,
    /// Column whose value becomes the key (string structure) or the hash field.
    pub key_column: Option<String>,
    /// Template producing the key, e.g. `user:${id}`.
    pub key_template: Option<String>,
    /// Fixed key for hash, list, set and sorted set structures.
    pub fixed_key: Option<String>,
    /// Column whose value becomes the hash field.
    pub hash_field_column: Option<String>,
    #[serde(default)]
    pub hash_field_prefix: String,
    /// Column holding the sorted set score.
    pub score_column: Option<String>,
}

/// Per-table transformation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RuleConfig {
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub exclude_columns: Vec<String>,
    #[serde(default)]
    pub column_case: ColumnCase,
    /// Explicit column renames. These win over [`RuleConfig::column_case`].
    #[serde(default)]
    pub column_mappings: HashMap<String, String>,
    /// Columns added to every row with a fixed value.
    #[serde(default)]
    pub constant_columns: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub encoding: ValueEncoding,
    pub template: Option<String>,
    #[serde(default = "default_datetime_format")]
    pub datetime_format: String,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    /// Keep the before-image of updated rows.
    #[serde(default)]
    pub retain_previous_row: bool,
    /// Column the bulk export orders pages by.
    pub order_column: Option<String>,
    /// Inline script source. Mutually exclusive with [`RuleConfig::script_file`].
    pub script: Option<String>,
    pub script_file: Option<PathBuf>,
    /// Column used as document id or message key. Defaults to the single primary key.
    pub key_column: Option<String>,
    /// Kafka or MQTT topic.
    pub topic: Option<String>,
    /// Elasticsearch index. Defaults to the table name.
    pub index: Option<String>,
    pub redis: Option<RedisRuleConfig>,
}

impl RuleConfig {
    pub const DEFAULT_DATETIME_FORMAT: &'static str = "%Y-%m-%d %H:%M:%S";

    pub const DEFAULT_DATE_FORMAT: &'static str = "%Y-%m-%d";

    /// Builds a declarative rule with defaults for every optional field.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            exclude_columns: Vec::new(),
            column_case: ColumnCase::default(),
            column_mappings: HashMap::new(),
            constant_columns: BTreeMap::new(),
            encoding: ValueEncoding::default(),
            template: None,
            datetime_format: default_datetime_format(),
            date_format: default_date_format(),
            retain_previous_row: false,
            order_column: None,
            script: None,
            script_file: None,
            key_column: None,
            topic: None,
            index: None,
            redis: None,
        }
    }

    pub fn is_script(&self) -> bool {
        self.script.is_some() || self.script_file.is_some()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.schema.is_empty() || self.table.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "rules.schema/table".to_string(),
                constraint: "must not be empty".to_string(),
            });
        }

        if self.script.is_some() && self.script_file.is_some() {
            return Err(ValidationError::InvalidFieldValue {
                field: format!("rules[{}.{}].script", self.schema, self.table),
                constraint: "`script` and `script_file` are mutually exclusive".to_string(),
            });
        }

        if self.encoding == ValueEncoding::Template && self.template.is_none() {
            return Err(ValidationError::InvalidFieldValue {
                field: format!("rules[{}.{}].template", self.schema, self.table),
                constraint: "required when encoding is `template`".to_string(),
            });
        }

        if let Some(redis) = &self.redis
            && !self.is_script()
            && matches!(
                redis.structure,
                RedisStructure::List | RedisStructure::Set | RedisStructure::SortedSet
            )
            && !self.retain_previous_row
        {
            return Err(ValidationError::InvalidFieldValue {
                field: format!("rules[{}.{}].retain_previous_row", self.schema, self.table),
                constraint: "must be true for list, set and sorted_set structures".to_string(),
            });
        }

        Ok(())
    }
}

fn default_datetime_format() -> String {
    RuleConfig::DEFAULT_DATETIME_FORMAT.to_string()
}

fn default_date_format() -> String {
    RuleConfig::DEFAULT_DATE_FORMAT.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structure_codes_round_trip() {
        for code in 1..=5 {
            assert_eq!(RedisStructure::from_code(code).unwrap().code(), code);
        }
        assert_eq!(RedisStructure::from_code(0), None);
        assert_eq!(RedisStructure::from_code(6), None);
    }

    #[test]
    fn template_encoding_requires_template() {
        let mut rule = RuleConfig::new("shop", "users");
        rule.encoding = ValueEncoding::Template;
        assert!(rule.validate().is_err());

        rule.template = Some("${id}".to_string());
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn redis_collections_require_the_previous_row() {
        let mut rule = RuleConfig::new("shop", "users");
        rule.redis = Some(RedisRuleConfig {
            structure: RedisStructure::List,
            ..Default::default()
        });
        assert!(rule.validate().is_err());

        rule.retain_previous_row = true;
        assert!(rule.validate().is_ok());

        rule.retain_previous_row = false;
        rule.script = Some("fn handle(event) { [] }".to_string());
        assert!(rule.validate().is_ok());
    }
}
