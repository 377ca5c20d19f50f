use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use config::shared::{RuleConfig, ValueEncoding};
use mysql::types::{BinlogValue, ColumnSchema, TableName, TableSchema};
use rhai::Engine;
use serde_json::{Value, json};

use crate::bail;
use crate::conversions::{DateFormats, convert_column_data, render_plain};
use crate::error::{ErrorKind, EtlResult};
use crate::rule::naming::wire_name;
use crate::rule::template::Template;
use crate::script::{CompiledScript, ScriptInput, ScriptOutput, ScriptSession};
use crate::types::{PipelineId, RowAction, RowEventRequest};

/// Transformed row keyed by wire name.
pub type RowMap = serde_json::Map<String, Value>;

/// How one source column reaches the output row.
#[derive(Debug, Clone)]
pub struct Padding {
    pub wire_name: String,
    /// Position of the column in the binlog row image.
    pub index: usize,
    pub column: ColumnSchema,
}

/// A rule compiled against the metadata of its table.
///
/// The context is immutable once built, except for the interpreter it owns for streaming
/// script rules. Every output row has exactly [`RuleContext::row_width`] entries.
pub struct RuleContext {
    pipeline_id: PipelineId,
    pipeline_name: String,
    rule: Arc<RuleConfig>,
    table: Arc<TableSchema>,
    padding: Vec<Padding>,
    /// Lower-cased column name to position in `padding`.
    padding_index: HashMap<String, usize>,
    constants: Vec<(String, Value)>,
    row_width: usize,
    formats: DateFormats,
    engine: Arc<Engine>,
    template: Option<Template>,
    key_template: Option<Template>,
    script: Option<CompiledScript>,
    interpreter: Option<Mutex<ScriptSession>>,
}

impl RuleContext {
    /// Compiles `rule` for `table`.
    ///
    /// Fails when a referenced column does not exist, when output names collide, when a
    /// template or date format is malformed, or when the script does not compile. With
    /// `preload_interpreter` a script rule also gets its own interpreter for streaming.
    pub fn build(
        pipeline_id: PipelineId,
        pipeline_name: &str,
        rule: Arc<RuleConfig>,
        table: Arc<TableSchema>,
        engine: Arc<Engine>,
        preload_interpreter: bool,
    ) -> EtlResult<Self> {
        check_columns_exist(&rule, &table)?;

        let mut padding = Vec::with_capacity(table.num_columns());
        let mut padding_index = HashMap::with_capacity(table.num_columns());
        for (index, column) in table.column_schemas.iter().enumerate() {
            let excluded = rule
                .exclude_columns
                .iter()
                .any(|name| name.eq_ignore_ascii_case(&column.name));
            if excluded {
                continue;
            }

            padding_index.insert(column.name.to_lowercase(), padding.len());
            padding.push(Padding {
                wire_name: wire_name(&column.name, &rule),
                index,
                column: column.clone(),
            });
        }

        let constants: Vec<(String, Value)> = rule
            .constant_columns
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let mut seen = HashSet::with_capacity(padding.len() + constants.len());
        for name in padding
            .iter()
            .map(|padding| &padding.wire_name)
            .chain(constants.iter().map(|(name, _)| name))
        {
            if !seen.insert(name.as_str()) {
                bail!(
                    ErrorKind::ConfigError,
                    "Duplicate output column",
                    format!("The rule for {} emits '{name}' more than once", table.name)
                );
            }
        }
        let row_width = padding.len() + constants.len();

        let formats = DateFormats::new(&rule.datetime_format, &rule.date_format)?;

        let template = match (rule.encoding, &rule.template) {
            (ValueEncoding::Template, Some(source)) => Some(Template::compile(&engine, source)?),
            (ValueEncoding::Template, None) => bail!(
                ErrorKind::ConfigError,
                "Missing template",
                format!("The rule for {} uses template encoding without a template", table.name)
            ),
            _ => None,
        };

        let key_template = match rule
            .redis
            .as_ref()
            .and_then(|redis| redis.key_template.as_ref())
        {
            Some(source) => Some(Template::compile(&engine, source)?),
            None => None,
        };

        let script_source = match (&rule.script, &rule.script_file) {
            (Some(source), _) => Some(source.clone()),
            (None, Some(path)) => Some(std::fs::read_to_string(path)?),
            (None, None) => None,
        };
        let script = match script_source {
            Some(source) => Some(CompiledScript::compile(engine.clone(), &source)?),
            None => None,
        };
        let interpreter = match (&script, preload_interpreter) {
            (Some(script), true) => Some(Mutex::new(script.session())),
            _ => None,
        };

        Ok(Self {
            pipeline_id,
            pipeline_name: pipeline_name.to_string(),
            rule,
            table,
            padding,
            padding_index,
            constants,
            row_width,
            formats,
            engine,
            template,
            key_template,
            script,
            interpreter,
        })
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    pub fn rule(&self) -> &RuleConfig {
        &self.rule
    }

    pub fn table(&self) -> &TableSchema {
        &self.table
    }

    pub fn table_name(&self) -> &TableName {
        &self.table.name
    }

    pub fn row_width(&self) -> usize {
        self.row_width
    }

    /// Looks up the padding of a column by its source name, ignoring case.
    pub fn padding(&self, column: &str) -> Option<&Padding> {
        self.padding_index
            .get(&column.to_lowercase())
            .and_then(|position| self.padding.get(*position))
    }

    pub fn is_script(&self) -> bool {
        self.script.is_some()
    }

    pub fn script(&self) -> Option<&CompiledScript> {
        self.script.as_ref()
    }

    /// The transformed current row of `request`.
    pub fn row(&self, request: &RowEventRequest) -> RowMap {
        self.row_from_values(&request.values)
    }

    /// The transformed before-image of an update, when it was retained.
    pub fn previous_row(&self, request: &RowEventRequest) -> Option<RowMap> {
        match (request.action, &request.previous) {
            (RowAction::Update, Some(previous)) => Some(self.row_from_values(previous)),
            _ => None,
        }
    }

    /// Builds the output map from a row image. Missing trailing values are treated as null.
    pub fn row_from_values(&self, values: &[BinlogValue]) -> RowMap {
        let mut row = RowMap::with_capacity(self.row_width);

        for padding in &self.padding {
            let value = values
                .get(padding.index)
                .map(|raw| convert_column_data(raw, &padding.column, &self.formats))
                .unwrap_or(Value::Null);
            row.insert(padding.wire_name.clone(), value);
        }
        for (name, value) in &self.constants {
            row.insert(name.clone(), value.clone());
        }

        row
    }

    /// Converts a single source column of `values`, including excluded columns.
    pub fn column_value(&self, values: &[BinlogValue], column: &str) -> Option<Value> {
        let index = self.table.find_column_index(column)?;
        let raw = values.get(index)?;

        Some(convert_column_data(
            raw,
            &self.table.column_schemas[index],
            &self.formats,
        ))
    }

    /// Serializes the current row per the rule's encoding.
    pub fn encode(&self, request: &RowEventRequest) -> EtlResult<String> {
        let row = self.row(request);
        self.encode_row(&row, request.action)
    }

    /// Serializes an already transformed row per the rule's encoding.
    pub fn encode_row(&self, row: &RowMap, action: RowAction) -> EtlResult<String> {
        match self.rule.encoding {
            ValueEncoding::Json => Ok(serde_json::to_string(row)?),
            ValueEncoding::KvCommas => Ok(row
                .iter()
                .map(|(name, value)| format!("{name}={}", render_plain(value)))
                .collect::<Vec<_>>()
                .join(",")),
            ValueEncoding::VCommas => Ok(row
                .values()
                .map(render_plain)
                .collect::<Vec<_>>()
                .join(",")),
            ValueEncoding::Template => match &self.template {
                Some(template) => template.render(&self.engine, row, action),
                None => bail!(
                    ErrorKind::EncodingError,
                    "Missing template",
                    format!("The rule for {} has no compiled template", self.table.name)
                ),
            },
        }
    }

    /// Message body for brokers and HTTP endpoints.
    ///
    /// JSON rules produce an envelope carrying the action, timestamp, table and rows. Other
    /// encodings produce the bare encoded row.
    pub fn encode_message(&self, request: &RowEventRequest) -> EtlResult<String> {
        if self.rule.encoding != ValueEncoding::Json {
            return self.encode(request);
        }

        let envelope = json!({
            "action": request.action.as_str(),
            "timestamp": request.timestamp,
            "schema": self.table.name.schema,
            "table": self.table.name.name,
            "data": self.row(request),
            "previous": self.previous_row(request),
        });

        Ok(serde_json::to_string(&envelope)?)
    }

    /// Name of the column identifying a row: the rule's key column or the single primary key.
    pub fn key_column(&self) -> Option<&str> {
        self.rule
            .key_column
            .as_deref()
            .or_else(|| self.table.single_primary_key().map(|column| column.name.as_str()))
    }

    /// The identifying value of the row, used as document id and message key.
    pub fn document_key(&self, request: &RowEventRequest) -> EtlResult<String> {
        let Some(column) = self.key_column() else {
            bail!(
                ErrorKind::EncodingError,
                "Missing key column",
                format!(
                    "The rule for {} has no key column and the table has no single primary key",
                    self.table.name
                )
            );
        };

        match self.column_value(&request.values, column) {
            Some(value) if !value.is_null() => Ok(render_plain(&value)),
            _ => bail!(
                ErrorKind::EncodingError,
                "Missing key value",
                format!("The column '{column}' of {} is null or absent", self.table.name)
            ),
        }
    }

    /// Renders the Redis key template against the current row, if one is configured.
    pub fn render_key_template(&self, request: &RowEventRequest) -> Option<EtlResult<String>> {
        let template = self.key_template.as_ref()?;
        let row = self.row(request);

        Some(template.render(&self.engine, &row, request.action))
    }

    /// Runs the rule's script for `request`.
    ///
    /// The given session is used when present, which is how bulk export workers pass their
    /// own interpreter. Otherwise the preloaded interpreter is used, or a fresh one when the
    /// context was built without it.
    pub fn run_script(
        &self,
        request: &RowEventRequest,
        session: Option<&mut ScriptSession>,
    ) -> EtlResult<Vec<ScriptOutput>> {
        let Some(script) = &self.script else {
            bail!(
                ErrorKind::InvalidState,
                "Rule has no script",
                format!("The rule for {} is declarative", self.table.name)
            );
        };

        let row = self.row(request);
        let previous = self.previous_row(request);
        let input = ScriptInput {
            action: request.action,
            row: &row,
            previous: previous.as_ref(),
        };

        match (session, &self.interpreter) {
            (Some(session), _) => session.call(&input),
            (None, Some(interpreter)) => interpreter
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .call(&input),
            (None, None) => script.session().call(&input),
        }
    }
}

impl fmt::Debug for RuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleContext")
            .field("pipeline_id", &self.pipeline_id)
            .field("table", &self.table.name)
            .field("row_width", &self.row_width)
            .field("script", &self.script.is_some())
            .finish_non_exhaustive()
    }
}

fn check_columns_exist(rule: &RuleConfig, table: &TableSchema) -> EtlResult<()> {
    let redis = rule.redis.as_ref();
    let referenced = rule
        .exclude_columns
        .iter()
        .chain(rule.column_mappings.keys())
        .chain(rule.key_column.iter())
        .chain(rule.order_column.iter())
        .chain(redis.and_then(|redis| redis.key_column.as_ref()))
        .chain(redis.and_then(|redis| redis.hash_field_column.as_ref()))
        .chain(redis.and_then(|redis| redis.score_column.as_ref()));

    for column in referenced {
        if table.find_column_index(column).is_none() {
            bail!(
                ErrorKind::ConfigError,
                "Rule references an unknown column",
                format!("The column '{column}' does not exist in {}", table.name)
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use config::shared::ColumnCase;
    use mysql::types::ColumnType;
    use serde_json::json;

    use super::*;
    use crate::script::new_engine;

    fn table() -> Arc<TableSchema> {
        Arc::new(TableSchema::new(
            TableName::new("shop", "users"),
            vec![
                ColumnSchema::new("id", ColumnType::Number).primary(),
                ColumnSchema::new("user_name", ColumnType::String),
                ColumnSchema::new("secret", ColumnType::String),
                ColumnSchema::new("state", ColumnType::Enum)
                    .with_enum_values(vec!["new".to_string(), "done".to_string()]),
            ],
        ))
    }

    fn build(rule: RuleConfig) -> EtlResult<Arc<RuleContext>> {
        RuleContext::build(
            1,
            "test",
            Arc::new(rule),
            table(),
            Arc::new(new_engine()),
            true,
        )
        .map(Arc::new)
    }

    fn request(context: &Arc<RuleContext>, action: RowAction) -> RowEventRequest {
        RowEventRequest::new(
            context.clone(),
            action,
            1_700_000_000,
            vec![5i64.into(), "alice".into(), "pw".into(), 2i64.into()],
        )
    }

    #[test]
    fn row_applies_exclusion_naming_and_constants() {
        let mut rule = RuleConfig::new("shop", "users");
        rule.exclude_columns = vec!["SECRET".to_string()];
        rule.column_case = ColumnCase::Camel;
        rule.constant_columns = BTreeMap::from([("source".to_string(), json!("mysql"))]);
        let context = build(rule).unwrap();

        let row = context.row(&request(&context, RowAction::Insert));

        assert_eq!(context.row_width(), 4);
        assert_eq!(row.len(), context.row_width());
        assert_eq!(
            Value::Object(row),
            json!({"id": 5, "userName": "alice", "state": "done", "source": "mysql"})
        );
        assert_eq!(context.padding("USER_NAME").unwrap().wire_name, "userName");
        assert!(context.padding("secret").is_none());
    }

    #[test]
    fn row_width_holds_for_short_images() {
        let context = build(RuleConfig::new("shop", "users")).unwrap();
        let request =
            RowEventRequest::new(context.clone(), RowAction::Insert, 0, vec![1i64.into()]);

        assert_eq!(context.row(&request).len(), context.row_width());
    }

    #[test]
    fn previous_row_only_for_retained_updates() {
        let mut rule = RuleConfig::new("shop", "users");
        rule.retain_previous_row = true;
        let context = build(rule).unwrap();

        let insert = request(&context, RowAction::Insert)
            .with_previous(vec![5i64.into(), "bob".into(), "pw".into(), 1i64.into()]);
        assert!(context.previous_row(&insert).is_none());

        let update = request(&context, RowAction::Update)
            .with_previous(vec![5i64.into(), "bob".into(), "pw".into(), 1i64.into()]);
        let previous = context.previous_row(&update).unwrap();
        assert_eq!(previous["user_name"], json!("bob"));
        assert_eq!(previous["state"], json!("new"));

        assert!(
            context
                .previous_row(&request(&context, RowAction::Update))
                .is_none()
        );
    }

    #[test]
    fn encodings() {
        let mut rule = RuleConfig::new("shop", "users");
        rule.exclude_columns = vec!["secret".to_string(), "state".to_string()];

        rule.encoding = ValueEncoding::KvCommas;
        let context = build(rule.clone()).unwrap();
        assert_eq!(
            context.encode(&request(&context, RowAction::Insert)).unwrap(),
            "id=5,user_name=alice"
        );

        rule.encoding = ValueEncoding::VCommas;
        let context = build(rule.clone()).unwrap();
        assert_eq!(
            context.encode(&request(&context, RowAction::Insert)).unwrap(),
            "5,alice"
        );

        rule.encoding = ValueEncoding::Template;
        rule.template = Some("${user_name}#${id}".to_string());
        let context = build(rule).unwrap();
        assert_eq!(
            context.encode(&request(&context, RowAction::Insert)).unwrap(),
            "alice#5"
        );
    }

    #[test]
    fn json_message_envelope() {
        let context = build(RuleConfig::new("shop", "users")).unwrap();
        let message = context
            .encode_message(&request(&context, RowAction::Delete))
            .unwrap();
        let message: Value = serde_json::from_str(&message).unwrap();

        assert_eq!(message["action"], json!("delete"));
        assert_eq!(message["table"], json!("users"));
        assert_eq!(message["data"]["user_name"], json!("alice"));
        assert_eq!(message["previous"], Value::Null);
    }

    #[test]
    fn document_key_uses_primary_key_or_key_column() {
        let context = build(RuleConfig::new("shop", "users")).unwrap();
        assert_eq!(
            context
                .document_key(&request(&context, RowAction::Insert))
                .unwrap(),
            "5"
        );

        let mut rule = RuleConfig::new("shop", "users");
        rule.key_column = Some("User_Name".to_string());
        rule.exclude_columns = vec!["user_name".to_string()];
        let context = build(rule).unwrap();
        assert_eq!(
            context
                .document_key(&request(&context, RowAction::Insert))
                .unwrap(),
            "alice"
        );

        let null_key = RowEventRequest::new(
            context.clone(),
            RowAction::Insert,
            0,
            vec![5i64.into(), BinlogValue::Null],
        );
        assert_eq!(
            context.document_key(&null_key).unwrap_err().kind(),
            ErrorKind::EncodingError
        );
    }

    #[test]
    fn build_rejects_bad_rules() {
        let mut rule = RuleConfig::new("shop", "users");
        rule.exclude_columns = vec!["missing".to_string()];
        assert_eq!(build(rule).unwrap_err().kind(), ErrorKind::ConfigError);

        let mut rule = RuleConfig::new("shop", "users");
        rule.column_mappings
            .insert("user_name".to_string(), "id".to_string());
        assert_eq!(build(rule).unwrap_err().kind(), ErrorKind::ConfigError);

        let mut rule = RuleConfig::new("shop", "users");
        rule.script = Some("fn handle(event) {".to_string());
        assert_eq!(
            build(rule).unwrap_err().kind(),
            ErrorKind::ScriptCompileError
        );

        let mut rule = RuleConfig::new("shop", "users");
        rule.encoding = ValueEncoding::Template;
        rule.template = Some("${id".to_string());
        assert_eq!(build(rule).unwrap_err().kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn script_rules_use_the_preloaded_interpreter() {
        let mut rule = RuleConfig::new("shop", "users");
        rule.script = Some(
            r#"
            fn handle(event) {
                let result = #{};
                result["insert_1_" + event.Row.id] = event.Row.user_name;
                result
            }
            "#
            .to_string(),
        );
        let context = build(rule).unwrap();

        let outputs = context
            .run_script(&request(&context, RowAction::Insert), None)
            .unwrap();

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].key(), "5");
    }
}
