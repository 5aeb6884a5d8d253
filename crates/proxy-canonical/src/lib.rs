#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **proxy-canonical** – Deterministic byte serialization and the event
//! chain hash.
//!
//! Canonical form orders object members lexicographically by field name,
//! keeps serde_json's shortest exact round-trippable scalar formatting, and
//! produces identical bytes on every platform. It is the input to hashing,
//! signatures and equality checks, so two records compare equal exactly when
//! their canonical encodings are byte-identical.
//!
//! The chain hash binds an event to its predecessor:
//! `chainHash = sha256(canonical(event \ {chainHash}) ‖ prevChainHash)`,
//! emitted as lowercase hex.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Errors produced while canonicalizing a record.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    /// The value (or a nested value) cannot be represented canonically.
    #[error("value cannot be canonicalized: {0}")]
    Unrepresentable(String),
    /// Scalar serialization failed.
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Field stripped from an event before hashing.
pub const CHAIN_HASH_FIELD: &str = "chainHash";

/// Field that must be present (possibly null) in the hashed form.
pub const PREV_CHAIN_HASH_FIELD: &str = "prevChainHash";

//─────────────────────────────
//  Canonical encoding
//─────────────────────────────

/// Canonical encoding of a JSON value as a string.
pub fn to_canonical_string(value: &Value) -> Result<String, CanonicalError> {
    let mut out = String::new();
    write_value(&mut out, value)?;
    Ok(out)
}

/// Canonical encoding of a JSON value as bytes.
pub fn to_canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    to_canonical_string(value).map(String::into_bytes)
}

/// Whether two values have identical canonical forms.
pub fn canonically_equal(a: &Value, b: &Value) -> Result<bool, CanonicalError> {
    Ok(to_canonical_string(a)? == to_canonical_string(b)?)
}

fn write_value(out: &mut String, value: &Value) -> Result<(), CanonicalError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => {
            if n.as_f64().is_some_and(|f| !f.is_finite()) {
                return Err(CanonicalError::Unrepresentable(format!(
                    "non-finite number {n}"
                )));
            }
            // serde_json renders integers via itoa and floats via ryu, both
            // of which are shortest exact round-trippable forms.
            out.push_str(&serde_json::to_string(n)?);
        }
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // Lexicographic (byte-order) member ordering.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_value(out, &map[key])?;
            }
            out.push('}');
        }
    }
    Ok(())
}

//─────────────────────────────
//  Hash chain
//─────────────────────────────

/// SHA-256 of `canonical(body) ‖ prevChainHash` as lowercase hex. A `None`
/// predecessor contributes nothing to the digest.
pub fn chain_hash(body: &Value, prev_chain_hash: Option<&str>) -> Result<String, CanonicalError> {
    let mut hasher = Sha256::new();
    hasher.update(to_canonical_bytes(body)?);
    if let Some(prev) = prev_chain_hash {
        hasher.update(prev.as_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Chain hash for an event record: strips `chainHash`, forces
/// `prevChainHash` to be present (null when absent), and hashes the result
/// against the event's own `prevChainHash`.
pub fn event_chain_hash(event: &Value) -> Result<String, CanonicalError> {
    let mut body = event
        .as_object()
        .cloned()
        .ok_or_else(|| CanonicalError::Unrepresentable("event must be an object".into()))?;
    body.remove(CHAIN_HASH_FIELD);
    body.entry(PREV_CHAIN_HASH_FIELD.to_string())
        .or_insert(Value::Null);
    let prev = body
        .get(PREV_CHAIN_HASH_FIELD)
        .and_then(Value::as_str)
        .map(str::to_owned);
    chain_hash(&Value::Object(body), prev.as_deref())
}

/// Verify a stored event's `chainHash` against its recomputed value.
pub fn verify_event_chain_hash(event: &Value) -> Result<bool, CanonicalError> {
    let recorded = event.get(CHAIN_HASH_FIELD).and_then(Value::as_str);
    match recorded {
        Some(recorded) => Ok(recorded == event_chain_hash(event)?),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn members_are_sorted_recursively() {
        let value = json!({"b": {"z": 1, "a": 2}, "a": [ {"y": 0, "x": 1} ]});
        assert_eq!(
            to_canonical_string(&value).unwrap(),
            r#"{"a":[{"x":1,"y":0}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn scalar_formatting_is_shortest_round_trip() {
        let value = json!([1, 1.5, -0.25, "a\"b\\c", "\u{1}"]);
        assert_eq!(
            to_canonical_string(&value).unwrap(),
            "[1,1.5,-0.25,\"a\\\"b\\\\c\",\"\\u0001\"]"
        );
    }

    #[test]
    fn canonical_equality_ignores_member_order() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert!(canonically_equal(&a, &b).unwrap());
    }

    #[test]
    fn chain_hash_is_hex_and_prev_sensitive() {
        let body = json!({"eventId": "e1", "prevChainHash": null});
        let first = chain_hash(&body, None).unwrap();
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let chained = chain_hash(&body, Some(&first)).unwrap();
        assert_ne!(first, chained);
        // Deterministic across calls.
        assert_eq!(chained, chain_hash(&body, Some(&first)).unwrap());
    }

    #[test]
    fn event_chain_hash_ignores_recorded_chain_hash() {
        let without = json!({
            "eventId": "e1",
            "type": "job.created",
            "at": "2026-08-01T00:00:00.000Z",
            "data": {},
            "prevChainHash": null
        });
        let expected = event_chain_hash(&without).unwrap();

        let mut with = without.clone();
        with["chainHash"] = Value::String(expected.clone());
        assert_eq!(event_chain_hash(&with).unwrap(), expected);
        assert!(verify_event_chain_hash(&with).unwrap());

        with["chainHash"] = Value::String("tampered".into());
        assert!(!verify_event_chain_hash(&with).unwrap());
    }

    #[test]
    fn event_chain_hash_defaults_missing_prev_to_null() {
        let implicit = json!({"eventId": "e1", "type": "t", "at": "now", "data": {}});
        let explicit = json!({
            "eventId": "e1", "type": "t", "at": "now", "data": {},
            "prevChainHash": null
        });
        assert_eq!(
            event_chain_hash(&implicit).unwrap(),
            event_chain_hash(&explicit).unwrap()
        );
    }

    // Arbitrary JSON trees for the round-trip law.
    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            any::<f64>().prop_filter("finite", |f| f.is_finite()).prop_map(|f| json!(f)),
            ".*".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 32, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map(".*", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn canonical_round_trip_is_fixed_point(value in arb_json()) {
            let canonical = to_canonical_string(&value).unwrap();
            let decoded: Value = serde_json::from_str(&canonical).unwrap();
            prop_assert_eq!(to_canonical_string(&decoded).unwrap(), canonical);
        }
    }
}
