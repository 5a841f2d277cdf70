//! Rendering native values as PostgreSQL text parameters.
//!
//! Parameters travel as text (or NULL), so this is the inverse of `decode`
//! for the value shapes a caller is likely to bind.

use std::fmt::Write;

use chrono::SecondsFormat;

use super::{Timestamp, Value};

/// Render a value as a text parameter. `None` is SQL NULL.
pub fn to_sql(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::Bool(v) => (if *v { "t" } else { "f" }).to_string(),
        Value::Int(v) => v.to_string(),
        Value::Float(v) => render_float(*v),
        Value::Text(s) => s.clone(),
        Value::Bytes(b) => {
            let mut out = String::with_capacity(2 + b.len() * 2);
            out.push_str("\\x");
            for byte in b.iter() {
                let _ = write!(out, "{:02x}", byte);
            }
            out
        }
        Value::Timestamp(ts) => render_timestamp(ts),
        Value::Json(v) => v.to_string(),
        Value::Array(items) => sql_array(items),
    };
    Some(text)
}

/// Render a (possibly nested) array literal such as `{{1,2},{NULL,"a b"}}`.
pub fn sql_array(items: &[Value]) -> String {
    let mut out = String::from("{");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match item {
            Value::Null => out.push_str("NULL"),
            Value::Array(inner) => out.push_str(&sql_array(inner)),
            other => {
                if let Some(text) = to_sql(other) {
                    push_element(&mut out, &text);
                }
            }
        }
    }
    out.push('}');
    out
}

/// Quote a string as an SQL literal. Backslashes switch to the `E''` form.
pub fn escape_literal(text: &str) -> String {
    let has_backslash = text.contains('\\');
    let mut out = String::with_capacity(text.len() + 4);
    if has_backslash {
        out.push_str(" E");
    }
    out.push('\'');
    for c in text.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn needs_quotes(text: &str) -> bool {
    text.is_empty()
        || text.eq_ignore_ascii_case("NULL")
        || text
            .bytes()
            .any(|c| matches!(c, b'{' | b'}' | b'"' | b',' | b'\\') || c.is_ascii_whitespace())
}

fn push_element(out: &mut String, text: &str) {
    if !needs_quotes(text) {
        out.push_str(text);
        return;
    }
    out.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

fn render_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "Infinity".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        v.to_string()
    }
}

fn render_timestamp(ts: &Timestamp) -> String {
    match ts {
        Timestamp::Infinity => "infinity".to_string(),
        Timestamp::NegInfinity => "-infinity".to_string(),
        Timestamp::At(t) => t.to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_sql_array_quotes_special_elements() {
        let input = vec![
            Value::from("tricky,,{}}{\"\\string"),
            Value::Null,
            Value::from("simpleString"),
            Value::Int(123),
            Value::from(","),
            Value::from("{"),
            Value::from("}"),
            Value::from("\\"),
            Value::from("\""),
        ];
        assert_eq!(
            sql_array(&input),
            r#"{"tricky,,{}}{\"\\string",NULL,simpleString,123,",","{","}","\\","\""}"#
        );
    }

    #[test]
    fn test_sql_array_nested() {
        let nested = vec![Value::Array(vec![Value::Array(vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
        ])])];
        assert_eq!(sql_array(&nested), "{{{1,2,3}}}");
        assert_eq!(
            sql_array(&[Value::from("null"), Value::from("")]),
            r#"{"null",""}"#
        );
    }

    #[test]
    fn test_to_sql_scalars() {
        assert_eq!(to_sql(&Value::Null), None);
        assert_eq!(to_sql(&Value::Bool(true)).as_deref(), Some("t"));
        assert_eq!(
            to_sql(&Value::Bytes(Bytes::from_static(&[0, 1, 2, 254, 255]))).as_deref(),
            Some("\\x000102feff")
        );
        let ts = Utc.with_ymd_and_hms(2016, 12, 24, 20, 58, 45).unwrap()
            + chrono::Duration::milliseconds(123);
        assert_eq!(
            to_sql(&Value::Timestamp(Timestamp::At(ts))).as_deref(),
            Some("2016-12-24T20:58:45.123Z")
        );
        assert_eq!(
            to_sql(&Value::Json(serde_json::json!({"a": 1}))).as_deref(),
            Some(r#"{"a":1}"#)
        );
    }

    #[test]
    fn test_escape_literal() {
        assert_eq!(escape_literal("John's dinner"), "'John''s dinner'");
        assert_eq!(escape_literal("234"), "'234'");
        assert_eq!(escape_literal(r"a\b"), r" E'a\\b'");
    }
}
