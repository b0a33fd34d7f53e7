//! Canonical dynamic values for event bodies, metadata, and snapshots.
//!
//! The runtime is schema-agnostic: bodies and metadata are carried as
//! [`Value`] trees and serialized with a canonical JSON-like encoding.
//! Byte strings and timestamps are tagged (`{"$bytes": ...}`,
//! `{"$time": ...}`) so they survive the trip; custom domain types go
//! through tags registered on a [`SerializerRegistry`]. Map keys are kept
//! sorted (`BTreeMap`), which makes the encoding deterministic.
//!
//! Keys beginning with `$` are reserved for tags and must not appear in
//! user maps.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ValueError;

/// A dynamic value with a canonical, deterministic encoding.
///
/// Timestamps carry millisecond precision; finer resolution is dropped at
/// the encoding boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Extension point: a value interpreted through a registered tag.
    Tagged(String, Box<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Shorthand for string lookups on map values; `None` elsewhere.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

impl Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let canonical = SerializerRegistry::with_builtins()
            .encode(self)
            .map_err(serde::ser::Error::custom)?;
        canonical.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = JsonValue::deserialize(deserializer)?;
        SerializerRegistry::with_builtins()
            .decode(&raw)
            .map_err(serde::de::Error::custom)
    }
}

/// How a registered tag converts its inner value.
enum TagCodec {
    /// Inner value uses the canonical encoding as-is.
    Transparent,
    Custom {
        serialize: Arc<dyn Fn(&Value) -> Result<JsonValue, ValueError> + Send + Sync>,
        deserialize: Arc<dyn Fn(&JsonValue) -> Result<Value, ValueError> + Send + Sync>,
    },
}

/// Table of tag serializers backing the canonical encoding.
///
/// `bytes` and `time` are pre-registered; domain code adds its own tags via
/// [`register`](Self::register) or [`register_transparent`](Self::register_transparent).
/// Encoding or decoding a [`Value::Tagged`] whose tag was never registered
/// fails with [`ValueError::UnknownTag`] — primitives always pass.
pub struct SerializerRegistry {
    tags: BTreeMap<String, TagCodec>,
}

impl SerializerRegistry {
    /// Registry with the built-in `bytes` and `time` tags.
    pub fn with_builtins() -> Self {
        let mut registry = Self { tags: BTreeMap::new() };

        registry.register(
            "bytes",
            |value| match value {
                Value::Bytes(b) => Ok(JsonValue::String(URL_SAFE_NO_PAD.encode(b))),
                other => Err(ValueError::Invalid(format!("$bytes expects a byte string, got {other:?}"))),
            },
            |raw| {
                let s = raw
                    .as_str()
                    .ok_or_else(|| ValueError::Invalid("$bytes expects a base64 string".to_string()))?;
                let bytes = URL_SAFE_NO_PAD
                    .decode(s)
                    .map_err(|e| ValueError::Invalid(format!("$bytes: {e}")))?;
                Ok(Value::Bytes(bytes))
            },
        );

        registry.register(
            "time",
            |value| match value {
                Value::Timestamp(ts) => Ok(JsonValue::from(ts.timestamp_millis())),
                other => Err(ValueError::Invalid(format!("$time expects a timestamp, got {other:?}"))),
            },
            |raw| {
                let ms = raw
                    .as_i64()
                    .ok_or_else(|| ValueError::Invalid("$time expects integer milliseconds".to_string()))?;
                let ts = DateTime::<Utc>::from_timestamp_millis(ms)
                    .ok_or_else(|| ValueError::Invalid(format!("$time out of range: {ms}")))?;
                Ok(Value::Timestamp(ts))
            },
        );

        registry
    }

    /// Register a tag with custom serialize/deserialize closures.
    pub fn register<S, D>(&mut self, tag: &str, serialize: S, deserialize: D)
    where
        S: Fn(&Value) -> Result<JsonValue, ValueError> + Send + Sync + 'static,
        D: Fn(&JsonValue) -> Result<Value, ValueError> + Send + Sync + 'static,
    {
        self.tags.insert(
            tag.to_string(),
            TagCodec::Custom {
                serialize: Arc::new(serialize),
                deserialize: Arc::new(deserialize),
            },
        );
    }

    /// Register a tag whose inner value uses the canonical encoding as-is.
    pub fn register_transparent(&mut self, tag: &str) {
        self.tags.insert(tag.to_string(), TagCodec::Transparent);
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.tags.contains_key(tag)
    }

    /// Encode a value into its canonical JSON form.
    pub fn encode(&self, value: &Value) -> Result<JsonValue, ValueError> {
        match value {
            Value::Null => Ok(JsonValue::Null),
            Value::Bool(b) => Ok(JsonValue::Bool(*b)),
            Value::Int(n) => Ok(JsonValue::from(*n)),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .ok_or_else(|| ValueError::Invalid(format!("non-finite float: {f}"))),
            Value::String(s) => Ok(JsonValue::String(s.clone())),
            Value::Bytes(_) => Ok(self.encode_tag("bytes", value)?),
            Value::Timestamp(_) => Ok(self.encode_tag("time", value)?),
            Value::Array(items) => {
                let encoded = items.iter().map(|v| self.encode(v)).collect::<Result<Vec<_>, _>>()?;
                Ok(JsonValue::Array(encoded))
            }
            Value::Map(map) => {
                let mut object = serde_json::Map::with_capacity(map.len());
                for (key, val) in map {
                    if key.starts_with('$') {
                        return Err(ValueError::Invalid(format!("map key '{key}' uses the reserved '$' prefix")));
                    }
                    object.insert(key.clone(), self.encode(val)?);
                }
                Ok(JsonValue::Object(object))
            }
            Value::Tagged(tag, inner) => match self.tags.get(tag) {
                None => Err(ValueError::UnknownTag(tag.clone())),
                Some(TagCodec::Transparent) => {
                    let encoded = self.encode(inner)?;
                    Ok(tag_object(tag, encoded))
                }
                Some(TagCodec::Custom { serialize, .. }) => Ok(tag_object(tag, serialize(inner)?)),
            },
        }
    }

    /// Decode a canonical JSON form back into a value.
    pub fn decode(&self, raw: &JsonValue) -> Result<Value, ValueError> {
        match raw {
            JsonValue::Null => Ok(Value::Null),
            JsonValue::Bool(b) => Ok(Value::Bool(*b)),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Float(f))
                } else {
                    Err(ValueError::Invalid(format!("unrepresentable number: {n}")))
                }
            }
            JsonValue::String(s) => Ok(Value::String(s.clone())),
            JsonValue::Array(items) => {
                let decoded = items.iter().map(|v| self.decode(v)).collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(decoded))
            }
            JsonValue::Object(object) => {
                // A single-key object whose key starts with '$' is a tag.
                if object.len() == 1 {
                    let (key, inner) = object.iter().next().expect("len checked");
                    if let Some(tag) = key.strip_prefix('$') {
                        return self.decode_tag(tag, inner);
                    }
                }

                let mut map = BTreeMap::new();
                for (key, val) in object {
                    if key.starts_with('$') {
                        return Err(ValueError::Invalid(format!("unexpected reserved key '{key}' in map")));
                    }
                    map.insert(key.clone(), self.decode(val)?);
                }
                Ok(Value::Map(map))
            }
        }
    }

    fn encode_tag(&self, tag: &str, value: &Value) -> Result<JsonValue, ValueError> {
        match self.tags.get(tag) {
            Some(TagCodec::Custom { serialize, .. }) => Ok(tag_object(tag, serialize(value)?)),
            _ => Err(ValueError::UnknownTag(tag.to_string())),
        }
    }

    fn decode_tag(&self, tag: &str, inner: &JsonValue) -> Result<Value, ValueError> {
        match self.tags.get(tag) {
            None => Err(ValueError::UnknownTag(tag.to_string())),
            Some(TagCodec::Transparent) => Ok(Value::Tagged(tag.to_string(), Box::new(self.decode(inner)?))),
            Some(TagCodec::Custom { deserialize, .. }) => {
                let value = deserialize(inner)?;
                // Built-in tags decode straight to their variant; custom tags
                // stay wrapped so re-encoding picks the same serializer.
                match tag {
                    "bytes" | "time" => Ok(value),
                    _ => Ok(Value::Tagged(tag.to_string(), Box::new(value))),
                }
            }
        }
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn tag_object(tag: &str, inner: JsonValue) -> JsonValue {
    let mut object = serde_json::Map::with_capacity(1);
    object.insert(format!("${tag}"), inner);
    JsonValue::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SerializerRegistry {
        SerializerRegistry::with_builtins()
    }

    #[test]
    fn primitives_round_trip() {
        let registry = registry();
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Int(-42),
            Value::Float(1.5),
            Value::String("hello".to_string()),
        ] {
            let encoded = registry.encode(&value).unwrap();
            assert_eq!(registry.decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn bytes_and_timestamps_are_tagged() {
        let registry = registry();

        let bytes = Value::Bytes(vec![1, 2, 3]);
        let encoded = registry.encode(&bytes).unwrap();
        assert!(encoded.get("$bytes").is_some());
        assert_eq!(registry.decode(&encoded).unwrap(), bytes);

        let ts = Value::Timestamp(DateTime::from_timestamp_millis(1_700_000_000_123).unwrap());
        let encoded = registry.encode(&ts).unwrap();
        assert_eq!(encoded.get("$time").unwrap().as_i64(), Some(1_700_000_000_123));
        assert_eq!(registry.decode(&encoded).unwrap(), ts);
    }

    #[test]
    fn map_encoding_is_deterministic() {
        let registry = registry();
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), Value::Int(2));
        map.insert("a".to_string(), Value::Int(1));

        let encoded = serde_json::to_string(&registry.encode(&Value::Map(map)).unwrap()).unwrap();
        assert_eq!(encoded, r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn unregistered_tag_is_rejected_both_ways() {
        let registry = registry();
        let tagged = Value::Tagged("money".to_string(), Box::new(Value::Int(100)));

        assert_eq!(registry.encode(&tagged), Err(ValueError::UnknownTag("money".to_string())));

        let raw = serde_json::json!({"$money": 100});
        assert_eq!(registry.decode(&raw), Err(ValueError::UnknownTag("money".to_string())));
    }

    #[test]
    fn registered_tag_round_trips() {
        let mut registry = registry();
        registry.register_transparent("money");

        let tagged = Value::Tagged(
            "money".to_string(),
            Box::new(Value::Map(BTreeMap::from([
                ("amount".to_string(), Value::Int(100)),
                ("currency".to_string(), Value::String("EUR".to_string())),
            ]))),
        );

        let encoded = registry.encode(&tagged).unwrap();
        assert_eq!(registry.decode(&encoded).unwrap(), tagged);
    }

    #[test]
    fn reserved_map_keys_are_rejected() {
        let registry = registry();
        let map = Value::Map(BTreeMap::from([("$oops".to_string(), Value::Null)]));

        assert!(matches!(registry.encode(&map), Err(ValueError::Invalid(_))));
    }
}
