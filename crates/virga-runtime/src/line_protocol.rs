//! Line-protocol encoding for the `toHTTP` sink
//!
//! One record per row: `name,tag=v,... field=v,... timestamp\n`. Tag and
//! field sets are sorted by key. Measurement names escape commas and
//! spaces; tag/field keys and tag values additionally escape `=`; string
//! field values are double-quoted with `"` and `\` escaped.

use std::fmt::Write;
use virga_core::{Error, Result, Time, Value};

fn escape_measurement(out: &mut String, s: &str) {
    for c in s.chars() {
        if matches!(c, ',' | ' ' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
}

fn escape_key(out: &mut String, s: &str) {
    for c in s.chars() {
        if matches!(c, ',' | '=' | ' ' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
}

fn escape_string_value(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

fn write_field_value(out: &mut String, value: &Value) -> Result<()> {
    match value {
        Value::Float(f) => write!(out, "{}", f).expect("writing to a String"),
        Value::Int(n) => write!(out, "{}i", n).expect("writing to a String"),
        Value::UInt(n) => write!(out, "{}u", n).expect("writing to a String"),
        Value::Bool(b) => write!(out, "{}", b).expect("writing to a String"),
        Value::Str(s) => escape_string_value(out, s),
        Value::Time(t) => write!(out, "{}i", t.nanos()).expect("writing to a String"),
        other => {
            return Err(Error::Type(format!(
                "{} is not a line-protocol field type",
                other.type_name()
            )))
        }
    }
    Ok(())
}

/// Encode one record. `tags` and `fields` are sorted by key before writing;
/// a record without fields is an error.
pub fn encode_record(
    out: &mut String,
    name: &str,
    tags: &[(&str, &str)],
    fields: &[(&str, Value)],
    time: Time,
) -> Result<()> {
    if fields.is_empty() {
        return Err(Error::invalid_argument(
            "line-protocol record without fields",
        ));
    }
    escape_measurement(out, name);

    let mut tags: Vec<&(&str, &str)> = tags.iter().collect();
    tags.sort_by_key(|(k, _)| *k);
    for (key, value) in tags {
        out.push(',');
        escape_key(out, key);
        out.push('=');
        escape_key(out, value);
    }

    let mut fields: Vec<&(&str, Value)> = fields.iter().collect();
    fields.sort_by_key(|(k, _)| *k);
    out.push(' ');
    for (i, (key, value)) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        escape_key(out, key);
        out.push('=');
        write_field_value(out, value)?;
    }

    out.push(' ');
    write!(out, "{}", time.nanos()).expect("writing to a String");
    out.push('\n');
    Ok(())
}
