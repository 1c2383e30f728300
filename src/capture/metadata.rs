//! Ordered key/value document attached to every frame

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::error::MetadataError;

/// A metadata value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(Object),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// Insertion-ordered object. Keys are unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Object {
    entries: Vec<(String, Value)>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new key. Fails if the key is already present.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), MetadataError> {
        let key = key.into();
        if self.contains_key(&key) {
            return Err(MetadataError::DuplicateKey(key));
        }
        self.entries.push((key, value.into()));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for Object {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl From<Object> for Value {
    fn from(obj: Object) -> Self {
        Value::Object(obj)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

/// Top-level document carried alongside a frame
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetadataDocument(Object);

impl MetadataDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), MetadataError> {
        self.0.put(key, value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_object(&self) -> &Object {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_keep_insertion_order() {
        let mut doc = MetadataDocument::new();
        doc.put("frame_number", 3i64).unwrap();
        doc.put("img_handle", "ab12c").unwrap();
        doc.put("ts_ingestor_entry", 17i64).unwrap();

        let keys: Vec<_> = doc.keys().collect();
        assert_eq!(keys, ["frame_number", "img_handle", "ts_ingestor_entry"]);
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let mut doc = MetadataDocument::new();
        doc.put("frame_number", 1i64).unwrap();
        let err = doc.put("frame_number", 2i64).unwrap_err();
        assert_eq!(err, MetadataError::DuplicateKey("frame_number".into()));
        assert_eq!(doc.get("frame_number").and_then(Value::as_i64), Some(1));
    }

    #[test]
    fn serializes_as_ordered_json() {
        let mut inner = Object::new();
        inner.put("x", 1i64).unwrap();
        inner.put("label", "car").unwrap();

        let mut doc = MetadataDocument::new();
        doc.put("z", 0.5).unwrap();
        doc.put("items", vec![Value::from(inner)]).unwrap();

        let json = serde_json::to_string(&doc).unwrap();
        assert_eq!(json, r#"{"z":0.5,"items":[{"x":1,"label":"car"}]}"#);
    }
}
