//! Common types used across storage operations.

use bytes::Bytes;

/// Key-value pair returned from prefix scans.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use sigbroker_storage::KeyValue;
///
/// let kv = KeyValue::new(Bytes::from("session/ab12"), Bytes::from(r#"{"state":"open"}"#));
/// assert!(kv.key.starts_with(b"session/"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key identifying this entry.
    pub key: Bytes,

    /// The value stored at this key.
    pub value: Bytes,
}

impl KeyValue {
    /// Creates a new key-value pair.
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// Returns the smallest key strictly greater than every key starting with
/// `prefix`, or `None` when the prefix is empty or all `0xFF`.
///
/// Used to turn a prefix scan into an ordered range scan.
#[must_use]
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upper_bound_increments_last_byte() {
        assert_eq!(prefix_upper_bound(b"doc/"), Some(b"doc0".to_vec()));
    }

    #[test]
    fn upper_bound_carries_past_max_bytes() {
        assert_eq!(prefix_upper_bound(&[b'a', 0xFF, 0xFF]), Some(vec![b'b']));
        assert_eq!(prefix_upper_bound(&[0xFF]), None);
        assert_eq!(prefix_upper_bound(b""), None);
    }
}
