use std::sync::Arc;

use trawl_core::error::AppError;

/// Shape check applied to each extracted item before it is emitted.
#[derive(Clone)]
pub enum ShapeCheck {
    /// Any JSON object passes.
    Object,
    /// Must satisfy a JSON Schema.
    Schema(Arc<jsonschema::Validator>),
}

impl ShapeCheck {
    pub fn object() -> Self {
        ShapeCheck::Object
    }

    /// Compile `schema`. An invalid schema is a configuration error.
    pub fn from_schema(schema: &serde_json::Value) -> Result<Self, AppError> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| AppError::ConfigError(format!("Invalid record schema: {e}")))?;
        Ok(ShapeCheck::Schema(Arc::new(validator)))
    }

    pub fn matches(&self, data: &serde_json::Value) -> bool {
        match self {
            ShapeCheck::Object => data.is_object(),
            ShapeCheck::Schema(validator) => validator.is_valid(data),
        }
    }
}

impl Default for ShapeCheck {
    fn default() -> Self {
        Self::object()
    }
}
