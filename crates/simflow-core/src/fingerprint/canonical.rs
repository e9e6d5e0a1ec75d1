//! Canonical JSON text and SHA-256 digests.
//!
//! Object keys are ordered by UTF-16 code units (RFC 8785 §3.2.3),
//! integer-valued floats are written as integers and non-finite numbers are
//! rejected. The text is produced directly so that key order does not depend
//! on the map type backing `serde_json::Value`.

use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

use crate::error::{Result, SimflowError};

fn normalize_number(n: &Number) -> Result<Number> {
    if n.is_i64() || n.is_u64() {
        return Ok(n.clone());
    }
    match n.as_f64() {
        Some(f) if !f.is_finite() => Err(SimflowError::MalformedCatalog(
            "NaN/Infinity not permitted in fingerprinted documents".to_string(),
        )),
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
            Ok(Number::from(f as i64))
        }
        _ => Ok(n.clone()),
    }
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(Vec<u16>, &String, &Value)> = map
                .iter()
                .map(|(k, v)| (k.encode_utf16().collect(), k, v))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            out.push('{');
            for (i, (_, key, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(v, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out)?;
            }
            out.push(']');
        }
        Value::Number(n) => out.push_str(&normalize_number(n)?.to_string()),
        other => out.push_str(&serde_json::to_string(other)?),
    }
    Ok(())
}

/// Compact canonical JSON text of `value`.
pub fn canonical_json(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 hex digest of the canonical text of `value`.
pub fn compute_digest(value: &Value) -> Result<String> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}
