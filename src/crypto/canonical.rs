// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Canonical JSON encoding.
//!
//! Object keys are emitted in sorted order at every depth with no
//! whitespace, so two structurally equal values always encode to the same
//! bytes regardless of field insertion order.

use serde::Serialize;
use serde_json::Value;

use super::CryptoError;

fn write_canonical(value: &Value, out: &mut String) -> Result<(), CryptoError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(&encode_str(s)?),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&encode_str(key)?);
                out.push(':');
                write_canonical(&map[*key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn encode_str(s: &str) -> Result<String, CryptoError> {
    serde_json::to_string(s).map_err(|_| CryptoError::Serialization("failed to encode string".into()))
}

/// Canonical encoding of an already-parsed JSON value.
pub fn canonical_string(value: &Value) -> Result<String, CryptoError> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

/// Canonical bytes of any serializable value.
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CryptoError> {
    let value = serde_json::to_value(value)
        .map_err(|_| CryptoError::Serialization("value is not representable as JSON".into()))?;
    Ok(canonical_string(&value)?.into_bytes())
}
