//! Field values stored in documents.
//!
//! Mirrors the value types a managed document database understands. JSON
//! conversions are lossy for the non-JSON kinds (timestamps and references
//! become strings, bytes become arrays of numbers, geo points become maps).
//! `Serialize`/`Deserialize` go through the same JSON form, so a `Document`
//! can be read from or written as a plain JSON object.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map as JsonMap, Number, Value as Json};

use crate::Document;

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    /// RFC 3339 timestamp as reported by the service.
    Timestamp(String),
    Bytes(Vec<u8>),
    /// Full resource name of another document.
    Reference(String),
    GeoPoint { latitude: f64, longitude: f64 },
    Array(Vec<FieldValue>),
    Map(Document),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Double(n) => Some(*n),
            FieldValue::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Document> {
        match self {
            FieldValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(v.into())
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Double(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<Vec<FieldValue>> for FieldValue {
    fn from(v: Vec<FieldValue>) -> Self {
        FieldValue::Array(v)
    }
}

impl From<Document> for FieldValue {
    fn from(v: Document) -> Self {
        FieldValue::Map(v)
    }
}

impl From<Json> for FieldValue {
    fn from(v: Json) -> Self {
        match v {
            Json::Null => FieldValue::Null,
            Json::Bool(b) => FieldValue::Boolean(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Integer(i),
                // u64 beyond i64::MAX and fractional numbers
                None => FieldValue::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => FieldValue::String(s),
            Json::Array(items) => FieldValue::Array(items.into_iter().map(Into::into).collect()),
            Json::Object(map) => FieldValue::Map(document_from_json(map)),
        }
    }
}

impl From<FieldValue> for Json {
    fn from(v: FieldValue) -> Self {
        match v {
            FieldValue::Null => Json::Null,
            FieldValue::Boolean(b) => Json::Bool(b),
            FieldValue::Integer(i) => Json::Number(i.into()),
            FieldValue::Double(d) => Number::from_f64(d).map(Json::Number).unwrap_or(Json::Null),
            FieldValue::String(s) | FieldValue::Timestamp(s) | FieldValue::Reference(s) => {
                Json::String(s)
            }
            FieldValue::Bytes(b) => Json::Array(b.into_iter().map(Json::from).collect()),
            FieldValue::GeoPoint {
                latitude,
                longitude,
            } => {
                let mut m = JsonMap::new();
                m.insert("latitude".into(), FieldValue::Double(latitude).into());
                m.insert("longitude".into(), FieldValue::Double(longitude).into());
                Json::Object(m)
            }
            FieldValue::Array(items) => Json::Array(items.into_iter().map(Into::into).collect()),
            FieldValue::Map(m) => Json::Object(document_to_json(m)),
        }
    }
}

fn document_from_json(map: JsonMap<String, Json>) -> Document {
    map.into_iter().map(|(k, v)| (k, v.into())).collect()
}

fn document_to_json(doc: Document) -> JsonMap<String, Json> {
    doc.into_iter().map(|(k, v)| (k, v.into())).collect()
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Json::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Json::deserialize(deserializer).map(FieldValue::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_numbers_keep_integer_precision() {
        assert_eq!(FieldValue::from(json!(30)), FieldValue::Integer(30));
        assert_eq!(FieldValue::from(json!(1.5)), FieldValue::Double(1.5));
        assert_eq!(
            FieldValue::from(json!(u64::MAX)),
            FieldValue::Double(u64::MAX as f64)
        );
    }

    #[test]
    fn nested_json_becomes_maps_and_arrays() {
        let v = FieldValue::from(json!({"name": "Ana", "tags": ["a", true], "addr": {"zip": null}}));
        let m = v.as_map().expect("map");
        assert_eq!(m["name"].as_str(), Some("Ana"));
        assert_eq!(
            m["tags"],
            FieldValue::Array(vec![FieldValue::from("a"), FieldValue::from(true)])
        );
        assert!(m["addr"].as_map().expect("nested")["zip"].is_null());
    }

    #[test]
    fn non_json_kinds_render_readably() {
        let geo = FieldValue::GeoPoint {
            latitude: 59.9,
            longitude: 10.7,
        };
        assert_eq!(Json::from(geo), json!({"latitude": 59.9, "longitude": 10.7}));
        assert_eq!(Json::from(FieldValue::Bytes(vec![1, 2])), json!([1, 2]));
        assert_eq!(Json::from(FieldValue::Double(f64::NAN)), Json::Null);
        assert_eq!(
            Json::from(FieldValue::Timestamp("2024-01-01T00:00:00Z".into())),
            json!("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn documents_read_and_write_as_json_objects() {
        let doc: Document =
            serde_json::from_str(r#"{"name": "Ana", "age": 30, "addr": {"zip": "0150"}}"#)
                .expect("object");
        assert_eq!(doc["age"], FieldValue::Integer(30));
        assert_eq!(
            doc["addr"].as_map().expect("nested")["zip"],
            FieldValue::from("0150")
        );
        assert!(serde_json::from_str::<Document>("[1, 2]").is_err());

        let out = serde_json::to_value(&doc).expect("serializable");
        assert_eq!(out, json!({"name": "Ana", "age": 30, "addr": {"zip": "0150"}}));
    }

    #[test]
    fn as_f64_widens_integers() {
        assert_eq!(FieldValue::Integer(3).as_f64(), Some(3.0));
        assert_eq!(FieldValue::from("x").as_f64(), None);
    }
}
