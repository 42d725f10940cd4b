use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::TraceError;

/// JSON-like value carried in event attributes and triplet state/action maps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PayloadValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<PayloadValue>),
    Map(Payload),
}

impl PayloadValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    fn validate(&self, path: &str) -> Result<(), TraceError> {
        match self {
            Self::Float(value) if !value.is_finite() => Err(TraceError::Validation(format!(
                "{path} MUST be a finite number"
            ))),
            Self::List(items) => {
                for (index, item) in items.iter().enumerate() {
                    item.validate(&format!("{path}[{index}]"))?;
                }
                Ok(())
            }
            Self::Map(inner) => inner.validate_at(path),
            _ => Ok(()),
        }
    }

    fn from_json_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(*flag),
            Value::Number(number) => match number.as_i64() {
                Some(int) => Self::Int(int),
                None => Self::Float(number.as_f64().unwrap_or_default()),
            },
            Value::String(text) => Self::Text(text.clone()),
            Value::Array(items) => Self::List(items.iter().map(Self::from_json_value).collect()),
            Value::Object(map) => Self::Map(Payload(
                map.iter()
                    .map(|(key, item)| (key.clone(), Self::from_json_value(item)))
                    .collect(),
            )),
        }
    }

    fn to_json_value(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(flag) => Value::Bool(*flag),
            Self::Int(int) => Value::Number(Number::from(*int)),
            Self::Float(float) => Number::from_f64(*float).map_or(Value::Null, Value::Number),
            Self::Text(text) => Value::String(text.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json_value).collect()),
            Self::Map(inner) => inner.to_json(),
        }
    }
}

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for PayloadValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<String>> for PayloadValue {
    fn from(values: Vec<String>) -> Self {
        Self::List(values.into_iter().map(Self::Text).collect())
    }
}

/// Ordered string-keyed map of [`PayloadValue`]s. No schema is enforced
/// beyond the value variants being serializable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, PayloadValue>);

impl Payload {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PayloadValue>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PayloadValue> {
        self.0.get(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(PayloadValue::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PayloadValue)> {
        self.0.iter()
    }

    /// Checks the payload can cross a serialization boundary.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] when any nested float is NaN or infinite.
    pub fn validate(&self) -> Result<(), TraceError> {
        self.validate_at("payload")
    }

    fn validate_at(&self, path: &str) -> Result<(), TraceError> {
        for (key, value) in &self.0 {
            value.validate(&format!("{path}.{key}"))?;
        }
        Ok(())
    }

    /// Builds a payload from a JSON object.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] when `value` is not a JSON object.
    pub fn from_json(value: &Value) -> Result<Self, TraceError> {
        let Value::Object(map) = value else {
            return Err(TraceError::Validation(
                "payload MUST be a JSON object".to_string(),
            ));
        };

        Ok(Self(
            map.iter()
                .map(|(key, item)| (key.clone(), PayloadValue::from_json_value(item)))
                .collect(),
        ))
    }

    /// Parses a payload from JSON text.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] for malformed JSON or a non-object root.
    pub fn from_json_str(raw: &str) -> Result<Self, TraceError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| TraceError::Validation(format!("invalid payload JSON: {err}")))?;
        Self::from_json(&value)
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.0 {
            map.insert(key.clone(), value.to_json_value());
        }
        Value::Object(map)
    }
}

impl FromIterator<(String, PayloadValue)> for Payload {
    fn from_iter<T: IntoIterator<Item = (String, PayloadValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_object_round_trips_through_payload() {
        let raw = r#"{"b":[1,2.5,"x"],"a":{"nested":true},"n":null}"#;
        let payload = match Payload::from_json_str(raw) {
            Ok(value) => value,
            Err(err) => panic!("unexpected payload error: {err}"),
        };

        assert_eq!(payload.len(), 3);
        assert_eq!(
            payload.get("b"),
            Some(&PayloadValue::List(vec![
                PayloadValue::Int(1),
                PayloadValue::Float(2.5),
                PayloadValue::Text("x".to_string()),
            ]))
        );
        let back = payload.to_json();
        assert_eq!(back["a"]["nested"], Value::Bool(true));
    }

    #[test]
    fn non_object_root_is_rejected() {
        assert!(matches!(
            Payload::from_json_str("[1,2]"),
            Err(TraceError::Validation(_))
        ));
    }

    #[test]
    fn nested_nan_fails_validation() {
        let inner = Payload::new().with("score", f64::NAN);
        let payload = Payload::new().with("outer", PayloadValue::Map(inner));

        let err = match payload.validate() {
            Ok(()) => panic!("expected NaN to be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("payload.outer.score"));
    }
}
