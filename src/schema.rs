//! Structural schemas for remote function inputs and outputs.
//!
//! A schema describes one JSON object: its fields, their types and whether
//! they are required. Validation is strict. Numbers are never read from
//! strings, integers never accept fractional values and unknown fields are
//! rejected instead of being silently dropped.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{RemoteError, Result};

/// A structured type that can cross the remote boundary.
///
/// Implementors pair their serde representation with a [`Schema`] that is
/// checked on both sides of every call.
pub trait Model: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Returns the object schema describing this type.
    fn schema() -> Schema;
}

/// The type of a single schema field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    /// A JSON string.
    String,
    /// A whole number (no fractional part, no string coercion).
    Integer,
    /// Any JSON number.
    Number,
    /// `true` or `false`.
    Boolean,
    /// A homogeneous array.
    Array(Box<FieldType>),
    /// A nested object with its own schema.
    Object(Schema),
    /// The inner type, or `null`.
    Nullable(Box<FieldType>),
    /// Any JSON value.
    Any,
}

impl FieldType {
    /// Shorthand for `FieldType::Array(Box::new(item))`.
    pub fn array(item: FieldType) -> Self {
        Self::Array(Box::new(item))
    }

    /// Shorthand for `FieldType::Nullable(Box::new(inner))`.
    pub fn nullable(inner: FieldType) -> Self {
        Self::Nullable(Box::new(inner))
    }

    fn describe(&self) -> String {
        match self {
            Self::String => "string".to_string(),
            Self::Integer => "integer".to_string(),
            Self::Number => "number".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::Array(item) => format!("array<{}>", item.describe()),
            Self::Object(schema) => format!("object {}", schema.name),
            Self::Nullable(inner) => format!("{} or null", inner.describe()),
            Self::Any => "any".to_string(),
        }
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<()> {
        let ok = match (self, value) {
            (Self::Any, _)
            | (Self::String, Value::String(_))
            | (Self::Boolean, Value::Bool(_))
            | (Self::Nullable(_), Value::Null) => true,
            (Self::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Number, Value::Number(_)) => true,
            (Self::Array(item), Value::Array(items)) => {
                for (i, element) in items.iter().enumerate() {
                    item.validate_at(element, &format!("{path}[{i}]"))?;
                }
                true
            }
            (Self::Object(schema), value) => return schema.validate_at(value, path),
            (Self::Nullable(inner), value) => return inner.validate_at(value, path),
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(RemoteError::validation(
                path,
                format!("expected {}, found {}", self.describe(), json_kind(value)),
            ))
        }
    }
}

/// One named field of an object schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    name: String,
    ty: FieldType,
    required: bool,
}

impl Field {
    /// Field name as it appears in the JSON object.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared type.
    pub fn ty(&self) -> &FieldType {
        &self.ty
    }

    /// Whether the field must be present.
    pub fn is_required(&self) -> bool {
        self.required
    }
}

/// An object schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    name: String,
    fields: Vec<Field>,
    open: bool,
}

impl Schema {
    /// Starts an object schema with no fields.
    pub fn object(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            open: false,
        }
    }

    /// An object schema that accepts any JSON object.
    ///
    /// Used where the real shape is only known on the remote side, such as
    /// ad-hoc calls from the command line.
    pub fn open(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            open: true,
        }
    }

    /// Adds a required field.
    #[must_use]
    pub fn required(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(Field {
            name: name.into(),
            ty,
            required: true,
        });
        self
    }

    /// Adds an optional field. Optional fields may be absent or `null`.
    #[must_use]
    pub fn optional(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(Field {
            name: name.into(),
            ty,
            required: false,
        });
        self
    }

    /// Schema name, usually the Rust type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared fields in declaration order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Whether this schema accepts arbitrary objects.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Validates a JSON value against this schema.
    pub fn validate(&self, value: &Value) -> Result<()> {
        self.validate_at(value, "$")
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<()> {
        let Value::Object(object) = value else {
            return Err(RemoteError::validation(
                path,
                format!("expected object {}, found {}", self.name, json_kind(value)),
            ));
        };

        if self.open {
            return Ok(());
        }

        self.check_unknown_fields(object, path)?;

        for field in &self.fields {
            let field_path = format!("{path}.{}", field.name);
            match object.get(&field.name) {
                None if field.required => {
                    return Err(RemoteError::validation(
                        field_path,
                        "required field is missing",
                    ));
                }
                None => {}
                Some(Value::Null) if !field.required => {}
                Some(value) => field.ty.validate_at(value, &field_path)?,
            }
        }

        Ok(())
    }

    fn check_unknown_fields(&self, object: &Map<String, Value>, path: &str) -> Result<()> {
        for key in object.keys() {
            if !self.fields.iter().any(|f| &f.name == key) {
                return Err(RemoteError::validation(
                    format!("{path}.{key}"),
                    format!("unknown field for {}", self.name),
                ));
            }
        }
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "fractional number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
