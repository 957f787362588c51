//! Defensive numeric coercion for open JSON payloads.
//!
//! Peers serialize 64-bit identifiers as strings, but older senders and
//! intermediate JSON re-encoders may turn them into float64 or narrower
//! integers. Every ID-bearing read goes through these helpers so all of
//! string / f64 / i64 / u64 inputs are accepted.

use serde_json::Value;

/// Coerce a JSON value to `u64`, accepting strings, floats, and integers.
///
/// Floats are accepted only when they are non-negative and integral (the
/// float64 image of an ID small enough not to have lost precision).
pub fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Some(u)
            } else if let Some(i) = n.as_i64() {
                u64::try_from(i).ok()
            } else {
                n.as_f64().and_then(f64_to_u64)
            }
        }
        Value::String(s) => parse_u64(s),
        _ => None,
    }
}

/// Coerce a JSON value to `i64`, accepting strings, floats, and integers.
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i)
            } else {
                n.as_f64().and_then(f64_to_i64)
            }
        }
        Value::String(s) => {
            let t = s.trim();
            t.parse::<i64>().ok().or_else(|| {
                t.parse::<f64>().ok().and_then(f64_to_i64)
            })
        }
        _ => None,
    }
}

/// Parse a `u64` from a string, tolerating float renderings like `"42.0"`.
pub fn parse_u64(s: &str) -> Option<u64> {
    let t = s.trim();
    t.parse::<u64>()
        .ok()
        .or_else(|| t.parse::<f64>().ok().and_then(f64_to_u64))
}

fn f64_to_u64(f: f64) -> Option<u64> {
    if f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 {
        Some(f as u64)
    } else {
        None
    }
}

fn f64_to_i64(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// Whether a column name carries a 64-bit identifier by convention.
pub fn is_id_column(name: &str) -> bool {
    name.ends_with("_id") || name.ends_with("_node")
}
