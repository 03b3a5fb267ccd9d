//! Response decoding and field extraction.
//!
//! All vendor responses are lifted into `serde_json::Value` first (JSON
//! directly, delimited text and CSV via a small structural encoding), then a
//! uniform dot-path selector pulls logical fields out.

use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};

use super::mapping::{ListLayout, ResponseDecoding, ResponseShape};

/// Decode a raw body per the declared decoding.
pub fn decode_body(text: &str, decoding: &ResponseDecoding) -> Result<Value> {
    match decoding {
        ResponseDecoding::Json => {
            serde_json::from_str(text).map_err(|e| anyhow!("invalid JSON body: {}", e))
        }
        ResponseDecoding::KeyValue {
            record_sep,
            field_sep,
        } => Ok(decode_key_value(text, record_sep, field_sep)),
        ResponseDecoding::Csv {
            delimiter,
            has_header,
        } => Ok(decode_csv(text, *delimiter, *has_header)),
    }
}

/// Delimited text -> object. `ACCESS_NUMBER:123:7999` becomes
/// `{"ACCESS_NUMBER": ["123", "7999"]}`; two-field records collapse the
/// array to a plain string. The untouched body is kept under `"raw"`.
fn decode_key_value(text: &str, record_sep: &str, field_sep: &str) -> Value {
    let mut out = Map::new();
    out.insert("raw".into(), Value::String(text.to_string()));

    for record in text.split(record_sep) {
        let record = record.trim();
        if record.is_empty() {
            continue;
        }
        let parts: Vec<&str> = record.split(field_sep).collect();
        match parts.len() {
            0 | 1 => {
                out.entry(record.to_string())
                    .or_insert(Value::String(String::new()));
            }
            2 => {
                out.insert(parts[0].to_string(), Value::String(parts[1].to_string()));
            }
            _ => {
                let rest: Vec<Value> = parts[1..]
                    .iter()
                    .map(|p| Value::String(p.to_string()))
                    .collect();
                out.insert(parts[0].to_string(), Value::Array(rest));
            }
        }
    }
    Value::Object(out)
}

/// CSV -> array. With a header row, each line becomes an object keyed by the
/// header names; without one, an array of string arrays.
fn decode_csv(text: &str, delimiter: char, has_header: bool) -> Value {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());

    if has_header {
        let header: Vec<String> = match lines.next() {
            Some(h) => h.split(delimiter).map(|c| c.trim().to_string()).collect(),
            None => return json!([]),
        };
        let rows: Vec<Value> = lines
            .map(|line| {
                let mut obj = Map::new();
                for (name, cell) in header.iter().zip(line.split(delimiter)) {
                    obj.insert(name.clone(), Value::String(cell.trim().to_string()));
                }
                Value::Object(obj)
            })
            .collect();
        Value::Array(rows)
    } else {
        let rows: Vec<Value> = lines
            .map(|line| {
                Value::Array(
                    line.split(delimiter)
                        .map(|c| Value::String(c.trim().to_string()))
                        .collect(),
                )
            })
            .collect();
        Value::Array(rows)
    }
}

/// Dot-path selector with array indices: `data.items.0.name`.
pub fn select<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// String extraction that also stringifies numbers and bools, since vendors
/// disagree about quoting.
pub fn select_string(value: &Value, path: &str) -> Option<String> {
    match select(value, path)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn select_f64(value: &Value, path: &str) -> Option<f64> {
    match select(value, path)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn select_i64(value: &Value, path: &str) -> Option<i64> {
    match select(value, path)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Iterate the rows of a list payload as `(external_key, row)` pairs.
///
/// `Rows` yields the array index as the key unless the shape maps an `id`
/// field; `KeyedRows` yields object keys. Returns an empty vec for an empty
/// payload, which is a legal vendor response.
pub fn iter_rows<'a>(value: &'a Value, shape: &ResponseShape) -> Result<Vec<(String, &'a Value)>> {
    let payload = match &shape.root {
        Some(root) => {
            select(value, root).ok_or_else(|| anyhow!("response root '{}' not found", root))?
        }
        None => value,
    };

    match (&shape.layout, payload) {
        (ListLayout::Rows, Value::Array(items)) => Ok(items
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let key = shape
                    .fields
                    .get("id")
                    .and_then(|p| select_string(row, p))
                    .unwrap_or_else(|| i.to_string());
                (key, row)
            })
            .collect()),
        (ListLayout::Rows, Value::Null) => Ok(vec![]),
        (ListLayout::KeyedRows, Value::Object(map)) => {
            Ok(map.iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        (ListLayout::KeyedRows, Value::Null) => Ok(vec![]),
        (layout, other) => Err(anyhow!(
            "payload shape mismatch: {:?} layout over {}",
            layout,
            type_name(other)
        )),
    }
}

/// Iterate a `{country: {service: leaf}}` price payload.
pub fn iter_country_service<'a>(
    value: &'a Value,
    shape: &ResponseShape,
) -> Result<Vec<(String, String, &'a Value)>> {
    let payload = match &shape.root {
        Some(root) => {
            select(value, root).ok_or_else(|| anyhow!("response root '{}' not found", root))?
        }
        None => value,
    };

    let countries = payload
        .as_object()
        .ok_or_else(|| anyhow!("country/service payload is not an object"))?;

    let mut out = Vec::new();
    for (country, services) in countries {
        let Some(services) = services.as_object() else {
            continue;
        };
        for (service, leaf) in services {
            out.push((country.clone(), service.clone(), leaf));
        }
    }
    Ok(out)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn key_value_decoding_shapes() {
        let decoded = decode_key_value("ACCESS_NUMBER:123:79991112233", "\n", ":");
        assert_eq!(
            select_string(&decoded, "ACCESS_NUMBER.0").as_deref(),
            Some("123")
        );
        assert_eq!(
            select_string(&decoded, "ACCESS_NUMBER.1").as_deref(),
            Some("79991112233")
        );

        let decoded = decode_key_value("ACCESS_BALANCE:17.50", "\n", ":");
        assert_eq!(select_f64(&decoded, "ACCESS_BALANCE"), Some(17.5));

        let decoded = decode_key_value("NO_NUMBERS", "\n", ":");
        assert!(decoded.get("NO_NUMBERS").is_some());
        assert_eq!(select_string(&decoded, "raw").as_deref(), Some("NO_NUMBERS"));
    }

    #[test]
    fn csv_with_header() {
        let decoded = decode_csv("id;name\n1;United States\n7;Russia", ';', true);
        let shape = ResponseShape {
            root: None,
            layout: ListLayout::Rows,
            fields: HashMap::from([("id".to_string(), "id".to_string())]),
        };
        let rows = iter_rows(&decoded, &shape).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "1");
        assert_eq!(select_string(rows[1].1, "name").as_deref(), Some("Russia"));
    }

    #[test]
    fn keyed_rows_iteration() {
        let value = serde_json::json!({
            "countries": { "0": { "name": "Russia" }, "187": { "name": "USA" } }
        });
        let shape = ResponseShape {
            root: Some("countries".into()),
            layout: ListLayout::KeyedRows,
            fields: HashMap::new(),
        };
        let rows = iter_rows(&value, &shape).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|(k, _)| k == "187"));
    }

    #[test]
    fn country_service_map_iteration() {
        let value = serde_json::json!({
            "ru": { "whatsapp": { "cost": 12.5, "count": 100 } },
            "us": { "telegram": { "cost": 0.8, "count": 3 } }
        });
        let shape = ResponseShape::default();
        let mut rows = iter_country_service(&value, &shape).unwrap();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "ru");
        assert_eq!(rows[0].1, "whatsapp");
        assert_eq!(select_f64(rows[0].2, "cost"), Some(12.5));
    }

    #[test]
    fn empty_list_is_legal() {
        let shape = ResponseShape::default();
        let empty = serde_json::json!([]);
        let rows = iter_rows(&empty, &shape).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn selector_missing_path_is_none() {
        let value = serde_json::json!({"a": {"b": 1}});
        assert!(select(&value, "a.c").is_none());
        assert_eq!(select_i64(&value, "a.b"), Some(1));
    }
}
