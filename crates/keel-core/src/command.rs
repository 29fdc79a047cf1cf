use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::event::Event;

/// A read-only view of all projected state at one point in time, keyed by
/// projection id. Handed to command handlers and event subscribers so they
/// never touch live aggregates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StateSnapshot {
    pub projections: BTreeMap<String, Value>,
}

impl StateSnapshot {
    pub fn get(&self, projection_id: &str) -> Option<&Value> {
        self.projections.get(projection_id)
    }
}

/// The result of running a command: zero or more events to feed through
/// the pipeline, plus an output value reported back to the caller (and,
/// for tool calls, embedded in `ToolCallCompleted`).
#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    pub events: Vec<Event>,
    pub output: Value,
}

impl CommandOutcome {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            events: vec![],
            output: Value::String(output.into()),
        }
    }

    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }
}

/// A command handler. Commands are synchronous requests-for-change: they
/// take input data plus a snapshot of current state and return events —
/// never mutating state directly.
pub type CommandHandler =
    Arc<dyn Fn(Value, &StateSnapshot) -> Result<CommandOutcome> + Send + Sync>;

/// Field types understood by [`InputSchema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldKind {
    fn json_name(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
        }
    }

    fn blank(self) -> Value {
        match self {
            FieldKind::String => Value::String(String::new()),
            FieldKind::Number => Value::from(0),
            FieldKind::Boolean => Value::Bool(false),
            FieldKind::Object => Value::Object(Default::default()),
            FieldKind::Array => Value::Array(vec![]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub description: String,
}

/// JSON-schema-like description of a command's input object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSchema {
    pub properties: BTreeMap<String, FieldSpec>,
    pub required: Vec<String>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, kind: FieldKind, description: &str) -> Self {
        self.properties.insert(
            name.to_string(),
            FieldSpec {
                kind,
                description: description.to_string(),
            },
        );
        self
    }

    pub fn require(mut self, name: &str) -> Self {
        self.required.push(name.to_string());
        self
    }

    /// Validate an input object against this schema, reporting the first
    /// mismatch.
    pub fn validate(&self, input: &Value) -> std::result::Result<(), String> {
        let object = input
            .as_object()
            .ok_or_else(|| "input must be an object".to_string())?;
        for name in &self.required {
            if !object.contains_key(name) {
                return Err(format!("missing required field '{name}'"));
            }
        }
        for (name, value) in object {
            if let Some(spec) = self.properties.get(name) {
                if !value.is_null() && !spec.kind.matches(value) {
                    return Err(format!(
                        "field '{name}' must be of type {}",
                        spec.kind.json_name()
                    ));
                }
            }
        }
        Ok(())
    }

    /// A zero-value instance of this schema's input object.
    pub fn blank(&self) -> Value {
        let mut object = serde_json::Map::new();
        for (name, spec) in &self.properties {
            object.insert(name.clone(), spec.kind.blank());
        }
        Value::Object(object)
    }

    /// Render as a JSON Schema object for LLM tool definitions.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        for (name, spec) in &self.properties {
            properties.insert(
                name.clone(),
                serde_json::json!({
                    "type": spec.kind.json_name(),
                    "description": spec.description,
                }),
            );
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": self.required,
        })
    }
}

/// A named command exposed by a plugin (or built in): handler plus the
/// schema its input is validated against.
#[derive(Clone)]
pub struct CommandSpec {
    pub name: String,
    pub description: String,
    pub schema: InputSchema,
    pub handler: CommandHandler,
}

impl CommandSpec {
    pub fn new(
        name: &str,
        description: &str,
        schema: InputSchema,
        handler: CommandHandler,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            schema,
            handler,
        }
    }
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}
