//! Simple proxy-ID codec.
//!
//! A simple proxy ID is `originalID * 10 + backendID`: the last decimal digit
//! names the backend, the rest is the backend-native ID. The radix-10 scheme
//! is invertible on both numeric IDs and decimal-string IDs without losing
//! the original representation, at the cost of a nine-backend ceiling.
//!
//! Hash-derived IDs (for entity types merged by name across backends) end in
//! `0`, which no simple ID can, so the two flavors stay structurally
//! distinguishable.

use serde_json::Value;

/// Hard cap on the fleet size, fixed by the decimal encoding.
pub const MAX_BACKENDS: u8 = 9;

const ENCODE_RADIX: i64 = 10;
const HASH_MODULUS: u32 = 10_000_000;

/// Extracts the backend digit from an ID value.
///
/// Returns `0` for the zero ID, for values below 10 (no backend digit yet),
/// and for anything that does not parse as a non-negative integer.
pub fn backend_of(id: &Value) -> u8 {
    match value_to_i64(id) {
        Some(n) if n >= ENCODE_RADIX => (n % ENCODE_RADIX) as u8,
        _ => 0,
    }
}

/// `originalID * 10 + backendID`, preserving the input representation.
///
/// Zero IDs pass through unchanged; non-numeric strings are not
/// backend-scoped identifiers and are returned as-is.
pub fn encode(id: &Value, backend_id: u8) -> Value {
    if is_zero_id(id) {
        tracing::debug!(id = %id, "Skipping zero ID");
        return id.clone();
    }

    match id {
        Value::Number(_) => match value_to_i64(id) {
            Some(n) => Value::from(n * ENCODE_RADIX + backend_id as i64),
            None => id.clone(),
        },
        Value::String(s) => match s.parse::<i64>() {
            Ok(n) => Value::String((n * ENCODE_RADIX + backend_id as i64).to_string()),
            Err(_) => {
                tracing::warn!(id = %s, "Non-numeric ID found");
                id.clone()
            }
        },
        other => {
            tracing::warn!(id = %other, "Unexpected ID type");
            other.clone()
        }
    }
}

/// Inverts [`encode`] when the ID belongs to `backend_id`.
///
/// Returns `None` when the backend digit does not match. Non-numeric strings
/// come back unchanged: they were never rewritten on the way out.
pub fn decode_for_backend(id: &Value, backend_id: u8) -> Option<Value> {
    match id {
        Value::Number(_) => {
            let n = value_to_i64(id)?;
            (n % ENCODE_RADIX == backend_id as i64).then(|| Value::from(n / ENCODE_RADIX))
        }
        Value::String(s) => match s.parse::<i64>() {
            Ok(n) => (n % ENCODE_RADIX == backend_id as i64)
                .then(|| Value::String((n / ENCODE_RADIX).to_string())),
            Err(_) => Some(id.clone()),
        },
        _ => None,
    }
}

/// The distinguished "applies to every backend" marker: `0` or `"0"`.
pub fn is_zero_id(id: &Value) -> bool {
    match id {
        Value::Number(n) => {
            n.as_i64() == Some(0) || n.as_u64() == Some(0) || n.as_f64() == Some(0.0)
        }
        Value::String(s) => s == "0",
        _ => false,
    }
}

/// `true` for a non-empty string of ASCII digits.
pub fn is_digit_string(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Numeric view of an ID value; floats are truncated like the dashboards do.
pub fn value_to_i64(id: &Value) -> Option<i64> {
    match id {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
            .or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
}

/// 32-bit FNV-1a. The hash-derived ID scheme is pinned to this exact fold,
/// so it is spelled out here rather than pulled from a 64-bit hasher crate.
pub fn fnv1a32(data: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Hash-derived proxy ID for a named entity: FNV-1a of the name, reduced
/// modulo 10^7, shifted to end in the `0` marker digit.
pub fn hash_proxy_id(name: &str) -> i64 {
    (fnv1a32(name) % HASH_MODULUS) as i64 * ENCODE_RADIX
}
