//! Stock post-processors for common payload handling.

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Error;
use crate::possibility::Possibility;
use crate::processor::{AnyValue, PostProcessor, ProcessContext, TypedPostProcessor};

/// Parses raw bytes as JSON.
///
/// Parse failures carry the source URL of the promise, when known.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPostProcessor;

impl TypedPostProcessor for JsonPostProcessor {
    type Input = Vec<u8>;
    type Output = Value;

    fn name(&self) -> &str {
        "json"
    }

    fn process_typed(
        &self,
        input: Possibility<Vec<u8>>,
        context: &ProcessContext<'_>,
    ) -> Possibility<Value> {
        input.and_then(|bytes| match serde_json::from_slice(&bytes) {
            Ok(value) => Possibility::Value(value),
            Err(e) => Possibility::Error(
                Error::processing(format!("invalid JSON: {e}")).with_source_url(context.source_url),
            ),
        })
    }
}

/// Extracts one field from a JSON object.
#[derive(Debug, Clone)]
pub struct JsonFieldPostProcessor {
    field: String,
}

impl JsonFieldPostProcessor {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl TypedPostProcessor for JsonFieldPostProcessor {
    type Input = Value;
    type Output = Value;

    fn name(&self) -> &str {
        "json_field"
    }

    fn process_typed(
        &self,
        input: Possibility<Value>,
        context: &ProcessContext<'_>,
    ) -> Possibility<Value> {
        input.and_then(|value| match value {
            Value::Object(mut map) => match map.remove(&self.field) {
                Some(field) => Possibility::Value(field),
                None => Possibility::Error(
                    Error::processing(format!("field {:?} is missing", self.field))
                        .with_source_url(context.source_url),
                ),
            },
            other => Possibility::Error(
                Error::processing(format!(
                    "cannot read field {:?} from a non-object ({})",
                    self.field,
                    json_kind(&other)
                ))
                .with_source_url(context.source_url),
            ),
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Deserializes raw JSON bytes straight into `T`.
pub struct DecodeJson<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> DecodeJson<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for DecodeJson<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for DecodeJson<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DecodeJson<{}>", type_name::<T>())
    }
}

impl<T: DeserializeOwned + Send + 'static> TypedPostProcessor for DecodeJson<T> {
    type Input = Vec<u8>;
    type Output = T;

    fn process_typed(
        &self,
        input: Possibility<Vec<u8>>,
        context: &ProcessContext<'_>,
    ) -> Possibility<T> {
        input.and_then(|bytes| {
            serde_json::from_slice(&bytes)
                .map_err(|e| {
                    Error::processing(format!("cannot decode {}: {e}", type_name::<T>()))
                        .with_source_url(context.source_url)
                })
                .into()
        })
    }
}

/// Converts an already parsed JSON value into `T`.
pub struct FromJsonValue<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> FromJsonValue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for FromJsonValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for FromJsonValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FromJsonValue<{}>", type_name::<T>())
    }
}

impl<T: DeserializeOwned + Send + 'static> TypedPostProcessor for FromJsonValue<T> {
    type Input = Value;
    type Output = T;

    fn process_typed(
        &self,
        input: Possibility<Value>,
        context: &ProcessContext<'_>,
    ) -> Possibility<T> {
        input.and_then(|value| {
            serde_json::from_value(value)
                .map_err(|e| {
                    Error::processing(format!("cannot convert to {}: {e}", type_name::<T>()))
                        .with_source_url(context.source_url)
                })
                .into()
        })
    }
}

/// Decodes raw bytes as UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8PostProcessor;

impl TypedPostProcessor for Utf8PostProcessor {
    type Input = Vec<u8>;
    type Output = String;

    fn name(&self) -> &str {
        "utf8"
    }

    fn process_typed(
        &self,
        input: Possibility<Vec<u8>>,
        context: &ProcessContext<'_>,
    ) -> Possibility<String> {
        input.and_then(|bytes| {
            String::from_utf8(bytes)
                .map_err(|e| {
                    Error::processing(format!("payload is not UTF-8: {e}"))
                        .with_source_url(context.source_url)
                })
                .into()
        })
    }
}

/// Replaces any value (or an empty result) with a fixed value.
///
/// Errors still pass through untouched.
#[derive(Debug, Clone)]
pub struct SingleValuePostProcessor<V> {
    value: V,
}

impl<V> SingleValuePostProcessor<V> {
    pub fn new(value: V) -> Self {
        Self { value }
    }
}

impl<V: Clone + Send + Sync + 'static> PostProcessor for SingleValuePostProcessor<V> {
    fn name(&self) -> &str {
        "single_value"
    }

    fn process(
        &self,
        input: Possibility<AnyValue>,
        _context: &ProcessContext<'_>,
    ) -> Possibility<AnyValue> {
        match input {
            Possibility::Error(err) => Possibility::Error(err),
            Possibility::Value(_) | Possibility::Empty => {
                Possibility::Value(Box::new(self.value.clone()))
            }
        }
    }
}
