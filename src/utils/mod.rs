// =============================================================================
// Orbiton Matrix Homeserver Core - Utilities
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Byte-level key codecs for the durable columns (big-endian u64 indexes,
//   0xff component separators), canonical JSON helpers and the wall clock.
//
// =============================================================================

pub mod error;

use std::time::{SystemTime, UNIX_EPOCH};

use rand::prelude::*;
use ruma::canonical_json::try_from_json_map;
use ruma::CanonicalJsonObject;

use crate::{Error, Result};

/// Separator between variable-length components of a column key.
pub const KEY_SEPARATOR: u8 = 0xff;

pub fn millis_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_millis() as u64
}

pub fn secs_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_secs()
}

pub fn u64_from_bytes(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::bad_database("u64 in database is invalid"))?;
    Ok(u64::from_be_bytes(array))
}

pub fn string_from_bytes(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::bad_database("string in database is invalid utf8"))
}

/// Builds a column key from variable-length components joined by 0xff.
pub fn make_key(components: &[&[u8]]) -> Vec<u8> {
    let len = components.iter().map(|c| c.len() + 1).sum::<usize>();
    let mut key = Vec::with_capacity(len);
    for (i, component) in components.iter().enumerate() {
        if i != 0 {
            key.push(KEY_SEPARATOR);
        }
        key.extend_from_slice(component);
    }
    key
}

/// Splits the last 8 bytes of a key off as a big-endian u64. The byte before
/// them, if any, must be the separator.
pub fn split_trailing_u64(key: &[u8]) -> Result<(&[u8], u64)> {
    if key.len() < 8 {
        return Err(Error::bad_database("key too short for trailing index"));
    }
    let (head, tail) = key.split_at(key.len() - 8);
    let head = head.strip_suffix(&[KEY_SEPARATOR]).unwrap_or(head);
    Ok((head, u64_from_bytes(tail)?))
}

pub fn to_canonical_object<T: serde::Serialize>(value: T) -> Result<CanonicalJsonObject> {
    use serde::ser::Error as _;

    match serde_json::to_value(value).map_err(Error::bad_json)? {
        serde_json::Value::Object(map) => {
            try_from_json_map(map).map_err(|e| Error::BadJson(e.to_string()))
        }
        _ => Err(Error::bad_json(serde_json::Error::custom(
            "value is not an object",
        ))),
    }
}

/// Random alphanumeric string, used for outgoing transaction ids.
pub fn random_string(length: usize) -> String {
    thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u64_round_trip() {
        for n in [0u64, 1, 255, 256, u64::MAX] {
            assert_eq!(u64_from_bytes(&n.to_be_bytes()).unwrap(), n);
        }
        assert!(u64_from_bytes(&[1, 2, 3]).is_err());
    }

    /// Test: column keys preserve component ordering under the natural
    /// byte ordering the trees use
    #[test]
    fn test_make_key_ordering() {
        let a = make_key(&[b"!room:orbiton.rs", &5u64.to_be_bytes()]);
        let b = make_key(&[b"!room:orbiton.rs", &6u64.to_be_bytes()]);
        assert!(a < b, "depth 5 must order before depth 6 under the same room");

        let (head, idx) = split_trailing_u64(&a).unwrap();
        assert_eq!(head, b"!room:orbiton.rs");
        assert_eq!(idx, 5);
    }

    #[test]
    fn test_to_canonical_object_rejects_non_objects() {
        assert!(to_canonical_object(42u8).is_err());
        let obj = to_canonical_object(serde_json::json!({"a": 1})).unwrap();
        assert_eq!(obj.len(), 1);
    }

    #[test]
    fn test_random_string_length() {
        let s = random_string(16);
        assert_eq!(s.len(), 16);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
