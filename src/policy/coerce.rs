//! Coercion of policy values into JSON protection parameters.
//!
//! Policy authors often write parameters as strings (`"true"`, `"['ci']"`,
//! `"3"`). Strings are turned into the typed value they spell when they spell
//! one: boolean literals first, then structured literals (lists, maps,
//! numbers, quoted strings, `None`). Anything else stays a raw string, so a
//! bare `null` is sent as the text `"null"`. Literal lists accept
//! single-quoted strings, `True`/`False`/`None` and tuple parentheses.

use serde_json::Value;

/// Converts one policy value into the JSON value sent to the server.
pub fn coerce_parameter(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => coerce_string(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(coerce_parameter).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, coerce_parameter(v)))
                .collect(),
        ),
    }
}

fn coerce_string(s: String) -> Value {
    match s.trim() {
        "true" | "True" => Value::Bool(true),
        "false" | "False" => Value::Bool(false),
        _ => parse_literal(&s).unwrap_or(Value::String(s)),
    }
}

/// Parses a literal written in JSON or in the common single-quoted list style.
///
/// Returns `None` when the text is not a literal (for example a bare word).
pub fn parse_literal(text: &str) -> Option<Value> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    serde_json::from_str(&normalize_literal(text)?).ok()
}

/// Rewrites single-quoted strings, tuples and capitalized keywords into JSON.
fn normalize_literal(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                out.push('"');
                loop {
                    let next = chars.next()?;
                    match next {
                        '\\' => {
                            let escaped = chars.next()?;
                            if escaped == '\'' {
                                out.push('\'');
                            } else {
                                out.push('\\');
                                out.push(escaped);
                            }
                        }
                        q if q == c => break,
                        '"' => out.push_str("\\\""),
                        other => out.push(other),
                    }
                }
                out.push('"');
            }
            '(' => out.push('['),
            ')' => out.push(']'),
            c if c.is_ascii_alphabetic() => {
                let mut word = String::from(c);
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        word.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.as_str() {
                    "True" => out.push_str("true"),
                    "False" => out.push_str("false"),
                    "None" => out.push_str("null"),
                    "null" => return None,
                    _ => out.push_str(&word),
                }
            }
            other => out.push(other),
        }
    }

    Some(out)
}
