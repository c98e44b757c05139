//! Decoding of BigQuery's tabular wire format.
//!
//! Rows arrive as `{"f": [{"v": <cell>}, ...]}` with every scalar encoded as a
//! string. Cells are turned into typed JSON using the result schema, so the
//! model sees `{"id": 7, "active": true}` rather than positional strings.

use super::types::FieldSchema;
use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Number, Value};

/// Decode wire rows into one JSON object per row, keyed by column name.
pub fn decode_rows(schema: &[FieldSchema], rows: &[Value]) -> Result<Vec<Map<String, Value>>> {
    rows.iter().map(|row| decode_record(schema, row)).collect()
}

fn decode_record(schema: &[FieldSchema], record: &Value) -> Result<Map<String, Value>> {
    let cells = record["f"]
        .as_array()
        .ok_or_else(|| Error::parse("row is missing its 'f' cell list"))?;
    if cells.len() != schema.len() {
        return Err(Error::parse(format!(
            "row has {} cells but schema has {} fields",
            cells.len(),
            schema.len()
        )));
    }

    let mut out = Map::with_capacity(schema.len());
    for (field, cell) in schema.iter().zip(cells) {
        out.insert(field.name.clone(), decode_cell(field, &cell["v"])?);
    }
    Ok(out)
}

fn decode_cell(field: &FieldSchema, v: &Value) -> Result<Value> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    if field.is_repeated() {
        let items = v
            .as_array()
            .ok_or_else(|| Error::parse(format!("REPEATED field '{}' is not an array", field.name)))?;
        return items
            .iter()
            .map(|item| decode_single(field, &item["v"]))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array);
    }
    decode_single(field, v)
}

fn decode_single(field: &FieldSchema, v: &Value) -> Result<Value> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    if field.is_record() {
        return decode_record(&field.fields, v).map(Value::Object);
    }

    let Some(raw) = v.as_str() else {
        // Already structured (e.g. a JSON column on some API versions).
        return Ok(v.clone());
    };

    let decoded = match field.field_type.as_str() {
        "INTEGER" | "INT64" => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.into())),
        "FLOAT" | "FLOAT64" => raw
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(raw.into())),
        "NUMERIC" | "BIGNUMERIC" | "DECIMAL" | "BIGDECIMAL" => decode_numeric(raw),
        "BOOLEAN" | "BOOL" => match raw {
            "true" | "TRUE" => Value::Bool(true),
            "false" | "FALSE" => Value::Bool(false),
            other => Value::String(other.into()),
        },
        "TIMESTAMP" => Value::String(decode_timestamp(raw)),
        "JSON" => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.into())),
        _ => Value::String(raw.into()),
    };
    Ok(decoded)
}

/// Exact decimals become JSON numbers only when an f64 holds them without loss.
fn decode_numeric(raw: &str) -> Value {
    let significant = raw
        .trim_start_matches('-')
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>();
    let significant = significant.trim_start_matches('0');
    if significant.len() <= 15
        && let Some(n) = raw.parse::<f64>().ok().and_then(Number::from_f64)
    {
        return Value::Number(n);
    }
    Value::String(raw.into())
}

/// TIMESTAMP cells are requested as int64 microseconds; older responses use float seconds.
fn decode_timestamp(raw: &str) -> String {
    let micros = raw.parse::<i64>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|s| s.is_finite())
            .map(|secs| (secs * 1_000_000.0).round() as i64)
    });
    micros
        .and_then(DateTime::from_timestamp_micros)
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .unwrap_or_else(|| raw.to_string())
}
