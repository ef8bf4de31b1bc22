//! Firestore REST v1 JSON encoding of document fields, plus update masks.

use std::borrow::Cow;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use domain::{Document, FieldValue, RemoteError};
use serde_json::{json, Map as JsonMap, Value as Json};

pub fn encode_value(v: &FieldValue) -> Json {
    match v {
        FieldValue::Null => json!({ "nullValue": null }),
        FieldValue::Boolean(b) => json!({ "booleanValue": b }),
        // int64 travels as a decimal string in proto3 JSON
        FieldValue::Integer(i) => json!({ "integerValue": i.to_string() }),
        FieldValue::Double(d) => json!({ "doubleValue": encode_double(*d) }),
        FieldValue::String(s) => json!({ "stringValue": s }),
        FieldValue::Timestamp(t) => json!({ "timestampValue": t }),
        FieldValue::Bytes(b) => json!({ "bytesValue": STANDARD.encode(b) }),
        FieldValue::Reference(r) => json!({ "referenceValue": r }),
        FieldValue::GeoPoint {
            latitude,
            longitude,
        } => json!({ "geoPointValue": { "latitude": latitude, "longitude": longitude } }),
        FieldValue::Array(items) => {
            let values: Vec<Json> = items.iter().map(encode_value).collect();
            json!({ "arrayValue": { "values": values } })
        }
        FieldValue::Map(m) => json!({ "mapValue": { "fields": encode_fields(m) } }),
    }
}

fn encode_double(d: f64) -> Json {
    if d.is_nan() {
        Json::from("NaN")
    } else if d == f64::INFINITY {
        Json::from("Infinity")
    } else if d == f64::NEG_INFINITY {
        Json::from("-Infinity")
    } else {
        Json::from(d)
    }
}

/// Encode a document as the `fields` object of a Firestore document.
pub fn encode_fields(doc: &Document) -> Json {
    let fields: JsonMap<String, Json> = doc
        .iter()
        .map(|(k, v)| (k.clone(), encode_value(v)))
        .collect();
    Json::Object(fields)
}

fn decode_err(msg: impl Into<String>) -> RemoteError {
    RemoteError::Decode(msg.into())
}

pub fn decode_value(v: &Json) -> Result<FieldValue, RemoteError> {
    let obj = v
        .as_object()
        .ok_or_else(|| decode_err("value is not an object"))?;
    let (kind, inner) = obj
        .iter()
        .next()
        .ok_or_else(|| decode_err("value has no type"))?;

    match kind.as_str() {
        "nullValue" => Ok(FieldValue::Null),
        "booleanValue" => inner
            .as_bool()
            .map(FieldValue::Boolean)
            .ok_or_else(|| decode_err("booleanValue is not a boolean")),
        "integerValue" => match inner {
            Json::String(s) => s
                .parse::<i64>()
                .map(FieldValue::Integer)
                .map_err(|e| decode_err(format!("integerValue {s:?}: {e}"))),
            Json::Number(n) => n
                .as_i64()
                .map(FieldValue::Integer)
                .ok_or_else(|| decode_err(format!("integerValue {n} out of range"))),
            _ => Err(decode_err("integerValue is not a number")),
        },
        "doubleValue" => decode_double(inner).map(FieldValue::Double),
        "stringValue" => as_string(inner, kind).map(FieldValue::String),
        "timestampValue" => as_string(inner, kind).map(FieldValue::Timestamp),
        "referenceValue" => as_string(inner, kind).map(FieldValue::Reference),
        "bytesValue" => {
            let raw = as_string(inner, kind)?;
            STANDARD
                .decode(raw.as_bytes())
                .or_else(|_| URL_SAFE.decode(raw.as_bytes()))
                .map(FieldValue::Bytes)
                .map_err(|e| decode_err(format!("bytesValue: {e}")))
        }
        "geoPointValue" => {
            // zero coordinates are omitted on the wire
            let coord = |name: &str| inner.get(name).and_then(Json::as_f64).unwrap_or(0.0);
            Ok(FieldValue::GeoPoint {
                latitude: coord("latitude"),
                longitude: coord("longitude"),
            })
        }
        "arrayValue" => match inner.get("values") {
            Some(Json::Array(values)) => values
                .iter()
                .map(decode_value)
                .collect::<Result<Vec<_>, _>>()
                .map(FieldValue::Array),
            Some(_) => Err(decode_err("arrayValue.values is not an array")),
            None => Ok(FieldValue::Array(Vec::new())),
        },
        "mapValue" => match inner.get("fields") {
            Some(fields) => decode_fields(fields).map(FieldValue::Map),
            None => Ok(FieldValue::Map(Document::new())),
        },
        other => Err(decode_err(format!("unsupported value type {other}"))),
    }
}

fn decode_double(inner: &Json) -> Result<f64, RemoteError> {
    match inner {
        Json::Number(n) => n
            .as_f64()
            .ok_or_else(|| decode_err("doubleValue out of range")),
        Json::String(s) => match s.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => other
                .parse::<f64>()
                .map_err(|e| decode_err(format!("doubleValue {other:?}: {e}"))),
        },
        _ => Err(decode_err("doubleValue is not a number")),
    }
}

fn as_string(inner: &Json, kind: &str) -> Result<String, RemoteError> {
    inner
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| decode_err(format!("{kind} is not a string")))
}

/// Decode the `fields` object of a Firestore document.
pub fn decode_fields(fields: &Json) -> Result<Document, RemoteError> {
    let obj = fields
        .as_object()
        .ok_or_else(|| decode_err("fields is not an object"))?;
    obj.iter()
        .map(|(k, v)| decode_value(v).map(|fv| (k.clone(), fv)))
        .collect()
}

/// Field paths of every leaf in `doc`. Non-empty nested maps contribute their
/// own leaves instead of replacing the whole map, which gives merge-all
/// semantics when used as an update mask.
pub fn update_mask(doc: &Document) -> Vec<String> {
    let mut out = Vec::new();
    collect_paths(doc, &mut Vec::new(), &mut out);
    out
}

fn collect_paths<'a>(doc: &'a Document, prefix: &mut Vec<&'a str>, out: &mut Vec<String>) {
    for (key, value) in doc {
        prefix.push(key);
        match value {
            FieldValue::Map(nested) if !nested.is_empty() => collect_paths(nested, prefix, out),
            _ => out.push(
                prefix
                    .iter()
                    .map(|s| quote_segment(s))
                    .collect::<Vec<_>>()
                    .join("."),
            ),
        }
        prefix.pop();
    }
}

/// Quote a field name with backticks unless it is a simple identifier.
pub fn quote_segment(name: &str) -> Cow<'_, str> {
    let mut chars = name.chars();
    let simple = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if simple {
        return Cow::Borrowed(name);
    }
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('`');
    for c in name.chars() {
        if c == '`' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('`');
    Cow::Owned(quoted)
}
