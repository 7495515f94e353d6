//! Parsed FHIR resources

use serde_json::Value;
use thiserror::Error;

/// Why a record could not be turned into a [`Resource`]
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid JSON at line {line}, column {column}: {message}")]
    Json {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Expected a JSON object, found {0}")]
    NotAnObject(&'static str),

    #[error("Empty record")]
    Empty,
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::Json {
            line: err.line(),
            column: err.column(),
            message: err.to_string(),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// One FHIR resource held as its JSON document
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    value: Value,
}

impl Resource {
    /// Parse a single JSON object
    ///
    /// Only the JSON shape is checked here; structural rules live in
    /// [`super::validate`].
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(ParseError::Empty);
        }
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ParseError> {
        if !value.is_object() {
            return Err(ParseError::NotAnObject(kind_of(&value)));
        }
        Ok(Self { value })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn resource_type(&self) -> Option<&str> {
        self.value.get("resourceType").and_then(Value::as_str)
    }

    pub fn id(&self) -> Option<&str> {
        self.value.get("id").and_then(Value::as_str)
    }

    pub fn is_bundle(&self) -> bool {
        self.resource_type() == Some("Bundle")
    }

    /// `Bundle.type` (transaction, batch, collection, ...)
    pub fn bundle_type(&self) -> Option<&str> {
        if !self.is_bundle() {
            return None;
        }
        self.value.get("type").and_then(Value::as_str)
    }

    /// Bundle entries; empty for anything that is not a bundle
    pub fn entries(&self) -> &[Value] {
        if !self.is_bundle() {
            return &[];
        }
        self.value
            .get("entry")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn entry_count(&self) -> usize {
        self.entries().len()
    }

    /// Resource type of each bundle entry, in entry order
    pub fn entry_types(&self) -> Vec<Option<&str>> {
        self.entries()
            .iter()
            .map(|e| {
                e.get("resource")
                    .and_then(|r| r.get("resourceType"))
                    .and_then(Value::as_str)
            })
            .collect()
    }
}
