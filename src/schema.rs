//! Caller-supplied extraction schemas and structural validation.
//!
//! A schema is an opaque contract from the caller's point of view: the
//! extraction engine never infers or extends it, it only restates it in the
//! prompt and validates the model's JSON against it. Validation is
//! structural — a tagged [`FieldKind`] tree checked recursively — never
//! runtime attribute probing.
//!
//! Model output is an untrusted external format: it is parsed and validated
//! at this boundary on every call, and violations are reported as plain
//! strings suitable for the one-shot repair prompt.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The shape a single extracted field must take.
///
/// `List` and `Object` nest; everything else is a scalar leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Int,
    Float,
    Bool,
    List { item: Box<FieldKind> },
    Object { fields: BTreeMap<String, FieldSpec> },
}

impl FieldKind {
    /// Short name used in violation messages and the prompt restatement.
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Int => "integer",
            FieldKind::Float => "number",
            FieldKind::Bool => "boolean",
            FieldKind::List { .. } => "array",
            FieldKind::Object { .. } => "object",
        }
    }

    /// Does `value` structurally match this kind?
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Int => value.is_i64() || value.is_u64(),
            FieldKind::Float => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::List { .. } => value.is_array(),
            FieldKind::Object { .. } => value.is_object(),
        }
    }
}

/// Specification of one schema field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(flatten)]
    pub kind: FieldKind,
    /// Free-text hint passed through to the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Required fields must be present and non-null. Default: true.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl FieldSpec {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            description: None,
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }
}

/// Caller-declared shape of the desired extraction JSON.
///
/// Field order is stable (`BTreeMap`) so the prompt restatement — and
/// therefore extraction on a deterministic backend — is byte-identical
/// across runs with the same inputs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtractionSchema {
    pub fields: BTreeMap<String, FieldSpec>,
    /// Optional free-text clarifications appended to the prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl ExtractionSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Machine-readable restatement embedded in the extraction prompt.
    ///
    /// Rendered as a JSON object `{field: {"type": ..., "description": ...}}`
    /// so the model sees exactly the contract validation will enforce.
    pub fn prompt_description(&self) -> String {
        fn describe_kind(kind: &FieldKind) -> Value {
            match kind {
                FieldKind::List { item } => serde_json::json!({
                    "type": "array",
                    "items": describe_kind(item),
                }),
                FieldKind::Object { fields } => {
                    let props: serde_json::Map<String, Value> = fields
                        .iter()
                        .map(|(name, spec)| (name.clone(), describe_spec(spec)))
                        .collect();
                    serde_json::json!({ "type": "object", "fields": props })
                }
                scalar => serde_json::json!({ "type": scalar.name() }),
            }
        }

        fn describe_spec(spec: &FieldSpec) -> Value {
            let mut v = describe_kind(&spec.kind);
            if let Some(obj) = v.as_object_mut() {
                if let Some(ref d) = spec.description {
                    obj.insert("description".into(), Value::String(d.clone()));
                }
                if !spec.required {
                    obj.insert("required".into(), Value::Bool(false));
                }
            }
            v
        }

        let props: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, spec)| (name.clone(), describe_spec(spec)))
            .collect();
        // BTreeMap iteration order makes this deterministic.
        serde_json::to_string_pretty(&Value::Object(props))
            .unwrap_or_else(|_| "{}".to_string())
    }

    /// Validate a parsed model response against this schema.
    ///
    /// Returns an empty vector on conformance; otherwise one human-readable
    /// violation per problem, phrased so the repair prompt can quote them
    /// verbatim.
    pub fn validate(&self, value: &Value) -> Vec<String> {
        let mut violations = Vec::new();
        let Some(obj) = value.as_object() else {
            violations.push(format!(
                "top-level value must be a JSON object, got {}",
                json_type_name(value)
            ));
            return violations;
        };
        validate_fields(&self.fields, obj, "", &mut violations);
        violations
    }
}

fn validate_fields(
    fields: &BTreeMap<String, FieldSpec>,
    obj: &serde_json::Map<String, Value>,
    path: &str,
    violations: &mut Vec<String>,
) {
    for (name, spec) in fields {
        let full = if path.is_empty() {
            name.clone()
        } else {
            format!("{path}.{name}")
        };
        match obj.get(name) {
            None | Some(Value::Null) => {
                if spec.required {
                    violations.push(format!("field '{full}' is required but missing or null"));
                }
            }
            Some(v) => validate_value(&spec.kind, v, &full, violations),
        }
    }
    // Extra fields the model volunteered are tolerated: the contract binds
    // what must be present, not what may additionally appear.
}

fn validate_value(kind: &FieldKind, value: &Value, path: &str, violations: &mut Vec<String>) {
    if !kind.matches(value) {
        violations.push(format!(
            "field '{path}': expected {}, got {}",
            kind.name(),
            json_type_name(value)
        ));
        return;
    }
    match kind {
        FieldKind::List { item } => {
            for (i, element) in value.as_array().unwrap().iter().enumerate() {
                validate_value(item, element, &format!("{path}[{i}]"), violations);
            }
        }
        FieldKind::Object { fields } => {
            validate_fields(fields, value.as_object().unwrap(), path, violations);
        }
        _ => {}
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Schema-aware union of per-chunk partial results.
///
/// Policy (documented, testable — not silent overwrite):
/// * arrays are concatenated in chunk order;
/// * scalar conflicts resolve as "first non-null wins";
/// * nested objects merge recursively under the same rules.
pub fn merge_partials(schema: &ExtractionSchema, partials: Vec<Value>) -> Value {
    let mut acc = serde_json::Map::new();
    for partial in partials {
        if let Value::Object(next) = partial {
            merge_object(&schema.fields, &mut acc, next);
        }
    }
    Value::Object(acc)
}

fn merge_object(
    fields: &BTreeMap<String, FieldSpec>,
    acc: &mut serde_json::Map<String, Value>,
    next: serde_json::Map<String, Value>,
) {
    for (name, incoming) in next {
        if incoming.is_null() {
            continue;
        }
        match acc.get_mut(&name) {
            None => {
                acc.insert(name, incoming);
            }
            Some(existing) => match (fields.get(&name).map(|s| &s.kind), existing, incoming) {
                (Some(FieldKind::List { .. }), Value::Array(held), Value::Array(mut more)) => {
                    held.append(&mut more);
                }
                (Some(FieldKind::Object { fields }), Value::Object(held), Value::Object(more)) => {
                    merge_object(fields, held, more);
                }
                // First non-null wins for scalars and for anything whose
                // shape the schema does not govern.
                _ => {}
            },
        }
    }
}
