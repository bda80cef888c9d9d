//! Canonical JSON bytes: the single serialization-for-hashing implementation.
//!
//! **Exactly one place** produces canonical JSON bytes in the workspace. Event
//! hashes, snapshot hashes, state digests and trace digests all route through
//! [`canonical_bytes`] or [`canonical_json_bytes`].
//!
//! # Canonicalization rules
//!
//! 1. Object keys are sorted lexicographically (byte order).
//! 2. No extraneous whitespace (compact form: `{"a":1,"b":2}`).
//! 3. Strings are JSON-escaped per RFC 8259 §7.
//! 4. Numbers must be integers (`i64` or `u64`). Floats, NaN and Infinity are
//!    rejected; scores and relevances are carried as integer permille.
//! 5. `null`, `true`, `false` are written literally.

use std::io::Write;

use serde::Serialize;
use thiserror::Error;

/// Error type for canonical JSON serialization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanonError {
    /// A JSON number was not an integer (float, NaN, Infinity).
    #[error("non-integer number in canonical JSON: {raw}")]
    NonIntegerNumber { raw: String },
    /// The value could not be converted into a JSON tree at all.
    #[error("value is not representable as JSON: {detail}")]
    Unrepresentable { detail: String },
}

/// Serialize any `Serialize` value into canonical JSON bytes.
///
/// # Errors
///
/// Returns [`CanonError`] if the value cannot be represented as JSON or
/// contains a non-integer number.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CanonError> {
    let tree = serde_json::to_value(value).map_err(|e| CanonError::Unrepresentable {
        detail: e.to_string(),
    })?;
    canonical_json_bytes(&tree)
}

/// Produce canonical JSON bytes from a `serde_json::Value`.
///
/// # Errors
///
/// Returns [`CanonError::NonIntegerNumber`] if any JSON number is not
/// representable as `i64` or `u64`.
pub fn canonical_json_bytes(value: &serde_json::Value) -> Result<Vec<u8>, CanonError> {
    let mut buf = Vec::new();
    write_value(&mut buf, value)?;
    Ok(buf)
}

fn write_value(buf: &mut Vec<u8>, value: &serde_json::Value) -> Result<(), CanonError> {
    match value {
        serde_json::Value::Null => buf.extend_from_slice(b"null"),
        serde_json::Value::Bool(true) => buf.extend_from_slice(b"true"),
        serde_json::Value::Bool(false) => buf.extend_from_slice(b"false"),
        serde_json::Value::Number(n) => write_number(buf, n)?,
        serde_json::Value::String(s) => write_string(buf, s),
        serde_json::Value::Array(arr) => {
            buf.push(b'[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                write_value(buf, item)?;
            }
            buf.push(b']');
        }
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            buf.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                write_string(buf, key);
                buf.push(b':');
                write_value(buf, &map[*key])?;
            }
            buf.push(b'}');
        }
    }
    Ok(())
}

fn write_number(buf: &mut Vec<u8>, n: &serde_json::Number) -> Result<(), CanonError> {
    // i64 first (negatives), then u64 (large positives).
    if let Some(i) = n.as_i64() {
        let _ = write!(buf, "{i}");
        Ok(())
    } else if let Some(u) = n.as_u64() {
        let _ = write!(buf, "{u}");
        Ok(())
    } else {
        Err(CanonError::NonIntegerNumber {
            raw: n.to_string(),
        })
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.push(b'"');
    for ch in s.chars() {
        match ch {
            '"' => buf.extend_from_slice(b"\\\""),
            '\\' => buf.extend_from_slice(b"\\\\"),
            '\n' => buf.extend_from_slice(b"\\n"),
            '\r' => buf.extend_from_slice(b"\\r"),
            '\t' => buf.extend_from_slice(b"\\t"),
            c if c < '\u{0020}' => {
                let _ = write!(buf, "\\u{:04x}", c as u32);
            }
            c => {
                let mut utf8_buf = [0u8; 4];
                buf.extend_from_slice(c.encode_utf8(&mut utf8_buf).as_bytes());
            }
        }
    }
    buf.push(b'"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn sorted_keys_nested() {
        let v = json!({"b": {"d": 1, "c": 2}, "a": 3});
        let bytes = canonical_json_bytes(&v).unwrap();
        assert_eq!(bytes, b"{\"a\":3,\"b\":{\"c\":2,\"d\":1}}");
    }

    #[test]
    fn whitespace_and_order_invariance() {
        let v1: serde_json::Value = serde_json::from_str("{ \"x\" : 1 , \"a\" : [2, 3] }").unwrap();
        let v2: serde_json::Value = serde_json::from_str(r#"{"a":[2,3],"x":1}"#).unwrap();
        assert_eq!(
            canonical_json_bytes(&v1).unwrap(),
            canonical_json_bytes(&v2).unwrap()
        );
    }

    #[test]
    fn rejects_float() {
        let err = canonical_json_bytes(&json!({"score": 0.5})).unwrap_err();
        assert!(matches!(err, CanonError::NonIntegerNumber { .. }));
    }

    #[test]
    fn accepts_integer_extremes() {
        let bytes = canonical_json_bytes(&json!({"a": -42, "b": u64::MAX})).unwrap();
        let expected = format!("{{\"a\":-42,\"b\":{}}}", u64::MAX);
        assert_eq!(bytes, expected.as_bytes());
    }

    #[test]
    fn escapes_control_characters() {
        let v = json!({"a": "line1\nline2\t\u{0001}\"q\""});
        let bytes = canonical_json_bytes(&v).unwrap();
        assert_eq!(bytes, b"{\"a\":\"line1\\nline2\\t\\u0001\\\"q\\\"\"}");
    }

    #[test]
    fn unicode_passthrough() {
        let bytes = canonical_json_bytes(&json!({"goal": "ship it 🚀"})).unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"goal":"ship it 🚀"}"#
        );
    }

    #[test]
    fn hashmap_iteration_order_does_not_leak() {
        let mut a = HashMap::new();
        let mut b = HashMap::new();
        for i in 0..32 {
            a.insert(format!("k{i}"), i);
        }
        for i in (0..32).rev() {
            b.insert(format!("k{i}"), i);
        }
        assert_eq!(canonical_bytes(&a).unwrap(), canonical_bytes(&b).unwrap());
    }
}
