//! Artifact metadata.
//!
//! Metadata is a free-form JSON object attached to an uploaded artifact.

use serde_json::{Map, Value};

use crate::error::AvailaiError;

/// Metadata attached to an artifact.
pub type Metadata = Map<String, Value>;

/// Key under which preprocessing provenance is recorded.
pub const PREPROCESSING_STEPS_KEY: &str = "preprocessing_steps";

/// Parses a JSON object from a command-line string.
///
/// # Errors
/// Returns an error if the input is not valid JSON, or is valid JSON but not
/// an object.
pub fn parse_metadata(input: &str) -> Result<Metadata, AvailaiError> {
    let value: Value =
        serde_json::from_str(input).map_err(|source| AvailaiError::MetadataParse {
            input: input.to_string(),
            source,
        })?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(AvailaiError::Validation(format!(
            "metadata must be a JSON object, found {}",
            json_kind(&other)
        ))),
    }
}

/// Records `steps` under `preprocessing_steps`, keeping every other key.
pub fn with_preprocessing_steps(mut metadata: Metadata, steps: Value) -> Metadata {
    metadata.insert(PREPROCESSING_STEPS_KEY.to_string(), steps);
    metadata
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
