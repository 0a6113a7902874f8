use serde_json::Value;
use std::collections::BTreeMap;

/// A query result projected into flat `name -> value` pairs.
pub type SecretFields = BTreeMap<String, String>;

/// Why a query result could not be read as [`SecretFields`].
#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("query produced no value")]
    Empty,
    #[error("query produced more than one value")]
    MultipleValues,
    #[error("query result is not an object (got {0})")]
    NotAnObject(&'static str),
    #[error("field {field:?} is not a string")]
    NonStringField { field: String },
    #[error("query result is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Parse newline-delimited query output that must hold exactly one object
/// whose members are all strings.
pub fn parse_secret_fields(raw: &str) -> Result<SecretFields, ShapeError> {
    let mut values = serde_json::Deserializer::from_str(raw).into_iter::<Value>();
    let value = values.next().ok_or(ShapeError::Empty)??;
    if values.next().is_some() {
        return Err(ShapeError::MultipleValues);
    }

    let obj = match value {
        Value::Object(obj) => obj,
        other => return Err(ShapeError::NotAnObject(kind(&other))),
    };
    obj.into_iter()
        .map(|(field, value)| match value {
            Value::String(s) => Ok((field, s)),
            _ => Err(ShapeError::NonStringField { field }),
        })
        .collect()
}
